use std::io::Write;

use extfs_cli::{args::parse_args, commands::run};

fn main() {
    let args = parse_args();
    let level = match args.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = run(args, &mut out);
    let _ = out.flush();
    if let Err(err) = result {
        eprintln!("extfs failed: {err:#}");
        std::process::exit(1);
    }
}
