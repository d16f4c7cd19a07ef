fn main() {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    println!("cargo:rerun-if-changed=./jogger.proto");
    tonic_build::compile_protos("./jogger.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
