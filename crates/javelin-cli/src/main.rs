use std::{env, fs, path::Path, process::ExitCode, time::UNIX_EPOCH};

use javelin::{CompileOptions, compile};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: javelin <file.py> [more.py ...]");
        return ExitCode::FAILURE;
    }
    for file_path in &args[1..] {
        if let Err(err) = compile_file(file_path) {
            eprintln!("{file_path}: {err}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn compile_file(file_path: &str) -> Result<(), String> {
    let path = Path::new(file_path);
    let source = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let module_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("__main__")
        .to_string();
    let mtime = fs::metadata(path)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64);

    let options = CompileOptions {
        filename: file_path.to_string(),
        module_name,
        mtime,
        ..CompileOptions::default()
    };
    let compiled = compile(&source, &options).map_err(|err| err.to_string())?;

    let out_path = path.with_file_name(format!("{}.class", compiled.class_name));
    fs::write(&out_path, &compiled.bytes).map_err(|err| err.to_string())?;
    println!(
        "wrote {} ({} bytes, {} methods)",
        out_path.display(),
        compiled.bytes.len(),
        compiled.methods.len()
    );
    Ok(())
}
