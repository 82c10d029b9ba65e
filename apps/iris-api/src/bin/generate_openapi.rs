use utoipa::OpenApi;

fn main() {
    let document = iris_api::routes::ApiDoc::openapi()
        .to_pretty_json()
        .expect("serialize openapi document");
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/iris-api.json");
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).expect("create specs directory");
    }
    std::fs::write(&out, document).expect("write openapi document");
    println!("Wrote {}", out.display());
}
