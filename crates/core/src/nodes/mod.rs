pub mod aura_model;
pub mod aura_sr;
pub mod backend;
pub mod transparency;
