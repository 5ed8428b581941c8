mod scheduler_hook;

pub use scheduler_hook::scheduler_hook;
