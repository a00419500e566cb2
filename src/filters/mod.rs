pub mod quad_model;
pub mod ukf;
