// src/lib.rs — Library root for Ouro

pub mod core;
pub mod infra;
pub mod provider;
pub mod storage;
pub mod tools;
pub mod ui;
