pub mod dispatcher;
pub mod error;
pub mod model;
pub mod script;
