mod common;
mod service_store_tests;
