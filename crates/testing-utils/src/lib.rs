//! 测试共用的构造器、替身与等待工具
//!
//! ```toml
//! [dev-dependencies]
//! jobflow-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
