pub mod stream_models;
