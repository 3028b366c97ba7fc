mod process;
mod task;

pub use process::{ProcessSpawner, WorkerProcess};
pub use task::{TaskSpawner, TaskWorker};
