tonic::include_proto!("jogger.v1");
