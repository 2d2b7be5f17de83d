pub mod http_worker_rpc;

pub use http_worker_rpc::{HttpWorkerRpc, HttpWorkerRpcFactory};
