use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("signal error: {0}")]
    NixError(String),

    #[error("could not take the {0} pipe of the child")]
    StreamPipeError(String),
}
