pub mod sys_numbering;
