pub mod mesh;
pub mod search;
