pub mod changelog;
pub mod history;
pub mod locks;
