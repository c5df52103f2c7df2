//! Нумерация документов и справочников.
//!
//! `service::SequenceService` выдает номера по ключу `domain/key`,
//! `registry::SequenceRegistry` хранит настройки и состояние,
//! `formatter`/`validator` отвечают за вид номера.

pub mod clock;
pub mod defaults;
pub mod error;
pub mod formatter;
pub mod registry;
pub mod repository;
pub mod reset;
pub mod service;
pub mod template;
pub mod validator;

pub use error::{NumberingError, NumberingResult, PersistenceError};
pub use registry::{MemoryRegistry, SequenceRegistry};
pub use repository::SqliteRegistry;
pub use service::SequenceService;
