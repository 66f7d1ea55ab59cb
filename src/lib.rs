//! Face ingestion and person clustering for a personal photo library.
//!
//! The scan pipeline finds faces in new photos and stores their embeddings;
//! the clustering engine groups every stored face into persons, keeping
//! user tags and hidden persons across runs. A UI drives both through
//! [`tasks::Coordinator`] and reads results through [`people::People`].

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod logging;
pub mod people;
pub mod scanner;
pub mod tasks;
