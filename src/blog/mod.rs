//! Blog post storage: list, search, and ownership-scoped CRUD.

pub mod store;

pub use store::{BlogStore, NewPost, Post, PostUpdate, SearchFilter};
