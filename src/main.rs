/// Entry point of the gadget tracer manager node agent.
///
/// Configuration is read from the environment, see [`gadget_tracer_manager::config`].
///
/// # Examples
///
/// ```bash
/// RUST_LOG=info GADGET_WATCHER=poll NODE_NAME=$(hostname) cargo run --features bpf
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    gadget_tracer_manager::run().await
}
