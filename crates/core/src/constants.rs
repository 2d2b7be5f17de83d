//! 持久化到实体上的固定失败原因

pub const DISPATCH_FAIL: &str = "dispatch fail";

pub const DISPATCH_FAIL_NO_WORKER: &str = "dispatch fail no worker";

pub const DISPATCH_QUEUE_FULL: &str = "dispatch queue full";

pub const TASK_FAIL: &str = "task fail";

pub const EMPTY_TASKS: &str = "empty tasks";

pub const JOB_FAIL: &str = "job fail";

/// 负载均衡参数在作业属性中的前缀
pub const LB_PARAM_PREFIX: &str = "worker.lb.";

pub const LB_APPOINT_WORKER_ID: &str = "worker.lb.appoint.worker-id";

pub const LB_HASH_KEY: &str = "worker.lb.hash-key";
