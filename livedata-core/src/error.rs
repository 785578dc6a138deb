//! Error type shared by the document store, the query compilers and EJSON.

use thiserror::Error;

use crate::ejson::EjsonError;

/// Errors raised by collection operations and selector/modifier compilation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate _id '{0}'")]
    DuplicateId(String),

    #[error("Malformed selector: {0}")]
    MalformedSelector(String),

    #[error("Malformed modifier: {0}")]
    MalformedModifier(String),

    #[error("Malformed sort specifier: {0}")]
    MalformedSort(String),

    #[error("Malformed projection: {0}")]
    MalformedProjection(String),

    #[error("Invalid document id: {0}")]
    InvalidId(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ejson(#[from] EjsonError),
}

pub type Result<T> = std::result::Result<T, Error>;
