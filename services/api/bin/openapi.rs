//! Writes the OpenAPI document of the voicebot API.
//!
//! Usage: `openapi [OUTPUT]`, defaulting to `openapi.json`.

use std::path::PathBuf;
use utoipa::OpenApi;
use voicebot_api::router::ApiDoc;

fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("openapi.json"));

    let spec_json = ApiDoc::openapi().to_pretty_json()?;
    std::fs::write(&path, spec_json)?;
    println!("Wrote {}", path.display());
    Ok(())
}
