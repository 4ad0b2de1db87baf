use colored::Colorize;

fn main() {
    if let Err(err) = ragmill::run_cli() {
        eprintln!("{} {err}", "error:".red());
        std::process::exit(1);
    }
}
