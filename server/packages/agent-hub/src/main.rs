fn main() {
    if let Err(err) = agent_hub::cli::run() {
        eprintln!("agent-hub: {err}");
        std::process::exit(1);
    }
}
