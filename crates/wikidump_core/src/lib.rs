pub mod alternate;
pub mod config;
pub mod editor;
pub mod html;
pub mod index_page;
pub mod layout;
pub mod model;
pub mod nav;
pub mod patch;
pub mod pipeline;
pub mod remote;
pub mod scan;
pub mod transform;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_support;
