use log::info;
use permit::Permit;
use std::net::TcpListener;
use uwuboard::config::SERVER_PORT;
use uwuboard::forum::{Forum, seed_demo};
use uwuboard::resource_cache::ResourceCache;
use uwuboard::{App, run_server};

fn main() -> Result<(), std::io::Error> {
    env_logger::init();
    std::fs::create_dir_all("uploads/deleted")?;
    let mut forum = Forum::new("uploads");
    seed_demo(&mut forum);
    let app = App {
        forum,
        cache: ResourceCache::new("."),
    };
    let listener = TcpListener::bind(("0.0.0.0", SERVER_PORT))?;
    info!("listening on port {SERVER_PORT}");
    run_server(listener, app, Permit::new())
}
