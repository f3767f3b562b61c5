use lattice_core::config::Config;
use lattice_embed::build_embedder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Config::load()?.settings()?;
    let embedder = build_embedder(&settings)?;
    let text = std::env::args().nth(1).unwrap_or_else(|| "hello world".to_string());
    let vector = embedder.embed(&text, settings.embedding_dimension).await?;
    let head = &vector[..vector.len().min(4)];
    println!("model={} dim={} head={:?}", embedder.model_id(), vector.len(), head);
    Ok(())
}
