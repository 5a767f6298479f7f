pub mod batching;
pub mod db;
pub mod device_import;
pub mod reference_import;
pub mod reports;
pub mod rows;
pub mod stream_reader;
