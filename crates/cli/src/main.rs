fn main() {
    transfer_cache_cli::init_logging();

    if let Err(error) = transfer_cache_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
