//! Типы, общие для backend и внешних потребителей сервиса нумерации.

pub mod system;
