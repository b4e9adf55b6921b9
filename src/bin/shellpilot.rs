use shellpilot::cli;

fn output_header() -> &'static str {
    "shellpilot\nInteractive script execution over SSH with pause, resume and crash recovery."
}

fn print_header() {
    eprintln!("{}\n", output_header());
}

fn run() -> Result<(), String> {
    print_header();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let output = cli::run_cli(args)?;
    println!("{output}");
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
