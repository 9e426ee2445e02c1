pub mod market;
pub mod portfolio;
pub mod matrix;
pub mod errors;

pub use market::*;
pub use portfolio::*;
pub use matrix::*;
pub use errors::*;
