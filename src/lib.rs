pub mod commands;
pub mod connection;
pub mod entity;
pub mod hass;
pub mod modbus;
pub mod output;
pub mod registers;

#[cfg(test)]
mod testing;
