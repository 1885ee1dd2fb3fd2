mod client;
mod handler;
pub mod parse;

pub use client::OsmPlaces;
pub use handler::PlacesClientHandler;
pub use parse::{parse_geocode, parse_nearby};
