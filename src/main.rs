use log::error;

fn main() {
    if let Err(err) = recunlock::cli::Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
