pub mod api;
pub mod middleware;
pub mod sys_numbering;
pub mod tracing;
