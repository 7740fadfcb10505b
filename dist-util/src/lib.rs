pub mod data_parallel;
pub mod dist_env;
pub mod process_group;

pub use data_parallel::DistributedDataParallel;
pub use dist_env::{init_process_group, DistEnv};
pub use process_group::{ProcessGroup, SingleProcess, TcpGroup};
