mod common;
mod config_tests;
mod evaluation_tests;
mod extraction_tests;
mod queue_tests;
