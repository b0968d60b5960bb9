pub mod experiment;
pub mod view;
pub mod wrap;
