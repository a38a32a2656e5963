pub mod control_routes;

pub use control_routes::control_routes;
