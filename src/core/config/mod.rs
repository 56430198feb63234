pub mod data;
pub mod io;
pub mod servers;
pub mod validation;
