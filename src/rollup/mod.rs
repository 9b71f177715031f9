pub mod compactor;
pub mod scheduler;
pub mod watermark;
