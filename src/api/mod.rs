pub mod auth;
pub mod hub;
pub mod rest;
pub mod ws;
