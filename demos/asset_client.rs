//! The client side of remote services: mounts the tool host's data directory
//! remotely and ferries a file over the wire.
//!
//! Run `tool_host` first, then
//! `cargo run --example asset_client -- /data/some/file.bin [host:port]`.

use bedrock::settings::Settings;
use bedrock::vfs::VfsFlags;
use bedrock::Engine;

fn main() {
    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "/data/hello.bin".to_string());
    let url = args.next().unwrap_or_else(|| "127.0.0.1:6006".to_string());

    let mut settings = Settings::default();
    settings.engine.connect_to_server = true;
    settings.engine.remote_services_url = url;

    let engine = Engine::initialize(settings).expect("engine boot");
    if !engine.remote().is_connected() {
        eprintln!("no tool host reachable; start the tool_host example first");
        std::process::exit(1);
    }
    engine.vfs().mount_remote("data", true).expect("remote mount");
    engine.vfs().register_file_change_callback(|changed| {
        println!("changed on host: {}", changed);
    });

    let (tx, rx) = crossbeam_channel::bounded::<usize>(1);
    engine
        .vfs()
        .read_file_async(&path, VfsFlags::NONE, None, move |path, blob| {
            println!("{}: {} bytes", path, blob.size());
            let _ = tx.send(blob.size());
        });

    match rx.recv_timeout(std::time::Duration::from_secs(10)) {
        Ok(_) => {}
        Err(_) => eprintln!("read timed out"),
    }
}
