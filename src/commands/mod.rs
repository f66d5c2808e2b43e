pub mod tcc;

pub use tcc::{run_tcc, TccArgs};
