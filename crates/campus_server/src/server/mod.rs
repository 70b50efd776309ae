#![forbid(unsafe_code)]

pub mod auth;
pub mod bus;
pub mod connection;
pub mod conversations;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod health;
pub mod notifier;
pub mod presence;
pub mod resolver;
pub mod room_hub;
pub mod rules;
pub mod state;
pub mod store;
pub mod sweep;

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod bus_tests;

#[cfg(test)]
mod conversation_tests;

#[cfg(test)]
mod fanout_tests;

#[cfg(test)]
mod presence_tests;



#[cfg(test)]
mod session_tests;
