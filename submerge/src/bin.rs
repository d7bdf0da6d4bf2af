use submerge::ServerImpl;

fn main() -> submerge_base::Result<()> {
    tracing::info!(target: "submerge", "starting server");
    let mut server = ServerImpl::new()?;
    server.start();
    Ok(())
}
