pub mod child;
pub mod error;
pub mod executable_data;
pub mod logging;
pub mod shutdown;
