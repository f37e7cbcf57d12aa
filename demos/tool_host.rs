//! The tool-host side of remote services: serves a local data directory to
//! connecting clients and answers console commands.
//!
//! Run with `cargo run --example tool_host -- <data-dir> [port]`, then point
//! `asset_client` at the printed port.

use bedrock::settings::Settings;
use bedrock::Engine;

fn main() {
    let mut args = std::env::args().skip(1);
    let data_dir = args.next().unwrap_or_else(|| ".".to_string());
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(6006);

    let mut settings = Settings::default();
    settings.tooling.enable_server = true;
    settings.tooling.server_port = port;

    let mut engine = Engine::initialize(settings).expect("engine boot");
    engine
        .vfs()
        .mount_local(&data_dir, "data", true)
        .expect("mounting data directory");
    engine
        .register_console(
            Some(Box::new(|cmdline| match cmdline {
                "version" => Ok(format!("bedrock {}", env!("CARGO_PKG_VERSION"))),
                other => Err(format!("unknown command '{}'", other)),
            })),
            None,
        )
        .expect("registering console");

    println!(
        "serving '{}' as /data on port {}",
        data_dir,
        engine.server_port().unwrap()
    );

    // Drive the frame loop; file-change events and client requests are
    // serviced on background threads.
    loop {
        engine.begin_frame(0.1);
        engine.end_frame();
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}
