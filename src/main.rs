use clap::App;
use clap::Arg;

#[tokio::main(flavor = "multi_thread", worker_threads = 3)]
async fn main() {
    let matches = App::new("caucus")
        .version("0.1.0")
        .about("Raft consensus node.")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .required(true)
                .default_value("Config.toml")
                .help("Location of the config file."),
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .value_name("ID")
                .takes_value(true)
                .help("Run as this node id, overriding the config file."),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let id_override = match matches.value_of("id") {
        Some(id) => match id.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                eprintln!("caucus: --id must be a number, got {:?}", id);
                std::process::exit(2);
            }
        },
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    if let Err(err) = caucus::run(config_path, id_override, (shutdown_tx, shutdown_rx)).await {
        eprintln!("caucus: {}", err);
        std::process::exit(1);
    }
}
