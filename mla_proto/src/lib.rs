tonic::include_proto!("mla.runtime.v1");

pub use mla_runtime_client::MlaRuntimeClient;
