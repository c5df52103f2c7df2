// Document numbering handlers
pub mod sys_numbering;
