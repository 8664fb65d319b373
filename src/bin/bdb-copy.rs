//! Copy tool: stream a consistent snapshot of a database to a file or stdout

use std::io::Write as IoWrite;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use burrowdb::{copy_to_file, copy_to_writer, CopyOptions, EnvBuilder};

static USER_BREAK: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn break_handler(_sig: libc::c_int) {
    USER_BREAK.store(true, Ordering::Release);
}

#[cfg(unix)]
fn install_break_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = (break_handler as extern "C" fn(libc::c_int)) as usize;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

fn usage(prog: &str) -> ExitCode {
    eprintln!(
        "usage: {prog} [-V] [-q] [-c] [-f] [-d] [-p] [-u|-U] [-n] src_path [dest_path]\n\
         \x20 -V\t\tprint version and exit\n\
         \x20 -q\t\tbe quiet\n\
         \x20 -c\t\tenable compactification (skip unused pages)\n\
         \x20 -f\t\tforce copying even if the target file exists\n\
         \x20 -d\t\tenforce copy to be a dynamic-size DB\n\
         \x20 -p\t\tpark/resume the MVCC snapshot during copy\n\
         \x20 -u\t\twarm up the database before copying\n\
         \x20 -U\t\twarm up and lock database pages in memory\n\
         \x20 -n\t\tno subdirectory: src_path is the data file\n\
         \x20 src_path\tsource database\n\
         \x20 dest_path\tdestination (stdout if not specified)"
    );
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("bdb-copy");

    let mut options = CopyOptions::default();
    let mut quiet = false;
    let mut warmup = false;
    let mut warmup_lock = false;
    let mut no_subdir = false;
    let mut positional: Vec<&str> = Vec::new();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-V" => {
                println!("bdb-copy {}", burrowdb::VERSION);
                return ExitCode::SUCCESS;
            }
            "-q" => quiet = true,
            "-c" => options.compact = true,
            "-f" => options.force = true,
            "-d" => options.dynamic_size = true,
            "-p" => options.throttle = true,
            "-u" => warmup = true,
            "-U" => {
                warmup = true;
                warmup_lock = true;
            }
            "-n" => no_subdir = true,
            flag if flag.starts_with('-') => return usage(prog),
            path => positional.push(path),
        }
    }

    let (src, dest) = match positional.as_slice() {
        [src] => (*src, None),
        [src, dest] => (*src, Some(*dest)),
        _ => return usage(prog),
    };

    #[cfg(unix)]
    install_break_handler();

    if !quiet {
        eprintln!("{prog}: copying {src} -> {}", dest.unwrap_or("stdout"));
    }

    let env = match EnvBuilder::new().no_subdir(no_subdir).open(src) {
        Ok(env) => env,
        Err(err) => {
            eprintln!("{prog}: cannot open {src}: {err}");
            return ExitCode::FAILURE;
        }
    };

    #[cfg(unix)]
    if warmup {
        if let Err(err) = env.warmup(warmup_lock) {
            if !quiet {
                eprintln!("{prog}: warmup failed: {err}");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (warmup, warmup_lock);

    if USER_BREAK.load(Ordering::Acquire) {
        eprintln!("{prog}: interrupted");
        return ExitCode::FAILURE;
    }

    let result = match dest {
        Some(path) => copy_to_file(&env, path, options),
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            copy_to_writer(&env, &mut out, options).and_then(|()| {
                out.flush().map_err(Into::into)
            })
        }
    };

    match result {
        Ok(()) => {
            if !quiet {
                eprintln!("{prog}: done");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{prog}: copy failed: {err}");
            ExitCode::FAILURE
        }
    }
}
