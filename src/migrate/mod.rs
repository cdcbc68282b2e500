pub mod content;
pub mod joomla;
pub mod linker;
pub mod reconcile;
pub mod tree;
