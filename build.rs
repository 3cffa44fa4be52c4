fn main() -> Result<(), Box<dyn std::error::Error>> {
    let method = |name: &str, route: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type("crate::proto::SubmitRequest")
            .output_type("crate::proto::SubmitResponse")
            .codec_path("tonic_prost::ProstCodec")
    };

    let relay = tonic_build::manual::Service::builder()
        .name("ResyncRelay")
        .package("k8s.relay.v1")
        .comment("Accepts resync snapshots from in-cluster watchers.")
        .method(method("submit", "Submit").build())
        .method(method("collect", "Collect").client_streaming().build())
        .build();

    tonic_build::manual::Builder::new().compile(&[relay]);
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
