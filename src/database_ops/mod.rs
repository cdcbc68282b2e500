pub mod db;
pub mod legacy;
pub mod memory;
