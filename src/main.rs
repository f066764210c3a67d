use std::process;

fn main() {
    if let Err(err) = kube_pico_cd::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
