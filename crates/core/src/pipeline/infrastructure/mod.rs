pub mod saving_result_consumer;
