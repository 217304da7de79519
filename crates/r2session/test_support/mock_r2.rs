//! Mock radare2 binary for integration testing
//!
//! Speaks the `radare2 -q0` side of r2pipe: a banner and NUL after startup, then one
//! NUL-terminated response per newline-terminated command on stdin.
//!
//! # Usage
//!
//! ```bash
//! mock_r2 -q0 malloc://64
//! ```
//!
//! # Commands
//!
//! - `w <text>` - write text at offset 0
//! - `ps` - print the written text
//! - `?e <text>` - echo
//! - `sj` / `ij` - JSON seek and file info
//! - `badj` - malformed JSON
//! - `===stderr` - create the side-channel file and return its path
//! - `q` / `q!` - exit
//!
//! Anything else is an error reported on the side channel (or real stderr
//! before `===stderr`), with an empty response.
//!
//! # Environment
//!
//! - `MOCK_R2_CHUNKED=1` - write responses one byte at a time
//! - `MOCK_R2_QUIT_CODE=<n>` - exit status used for `q`
//! - `MOCK_R2_IGNORE_QUIT=1` - never exit on its own after `q`
//!
//! # Special Flags
//!
//! - `-v` → print version and exit

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use serde_json::json;

const VERSION: &str = "radare2 5.9.4 0 @ mock-x86-64";

struct Args {
    target: String,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut target = None;
        for arg in env::args().skip(1) {
            if arg == "-v" {
                println!("{}", VERSION);
                println!("commit: mock");
                process::exit(0);
            } else if arg.starts_with('-') {
                // -q0 and any extra flags from SpawnOptions
            } else {
                target = Some(arg);
            }
        }
        target
            .map(|target| Args { target })
            .ok_or_else(|| "Usage: mock_r2 -q0 <target>".to_string())
    }
}

struct Mock {
    target: String,
    size: u64,
    data: String,
    side_channel: Option<(PathBuf, File)>,
    chunked: bool,
}

impl Mock {
    fn open(target: String) -> Result<Self, String> {
        if target.starts_with("/nonexistent") {
            return Err(format!("Cannot open '{}'", target));
        }
        let size = target
            .strip_prefix("malloc://")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        Ok(Mock {
            target,
            size,
            data: String::new(),
            side_channel: None,
            chunked: env::var("MOCK_R2_CHUNKED").is_ok_and(|v| v == "1"),
        })
    }

    fn handle(&mut self, command: &str) -> io::Result<String> {
        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        let output = match name {
            "w" => {
                self.data = rest.to_string();
                String::new()
            }
            "ps" => format!("{}\n", self.data),
            "?e" => format!("{}\n", rest),
            "sj" => format!("{}\n", json!({"offset": 0, "current": true})),
            "ij" => format!(
                "{}\n",
                json!({"core": {"file": self.target, "size": self.size}})
            ),
            "badj" => "{\"core\": \n".to_string(),
            "===stderr" => self.open_side_channel()?,
            _ => {
                self.report(&format!("ERROR: Unknown command '{}'\n", command))?;
                String::new()
            }
        };
        Ok(output)
    }

    fn open_side_channel(&mut self) -> io::Result<String> {
        if let Some((path, _)) = &self.side_channel {
            return Ok(path.display().to_string());
        }
        let path = env::temp_dir().join(format!("mock_r2-{}.stderr", process::id()));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let reply = path.display().to_string();
        self.side_channel = Some((path, file));
        Ok(reply)
    }

    fn report(&mut self, message: &str) -> io::Result<()> {
        match &mut self.side_channel {
            Some((_, file)) => {
                file.write_all(message.as_bytes())?;
                file.flush()
            }
            None => {
                eprint!("{}", message);
                Ok(())
            }
        }
    }

    fn respond(&self, out: &mut impl Write, text: &str) -> io::Result<()> {
        if self.chunked {
            for byte in text.as_bytes().iter().chain(&[0u8]) {
                out.write_all(&[*byte])?;
                out.flush()?;
            }
            Ok(())
        } else {
            out.write_all(text.as_bytes())?;
            out.write_all(&[0])?;
            out.flush()
        }
    }
}

impl Drop for Mock {
    fn drop(&mut self) {
        if let Some((path, _)) = self.side_channel.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn quit() -> ! {
    if env::var("MOCK_R2_IGNORE_QUIT").is_ok_and(|v| v == "1") {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
    let code = env::var("MOCK_R2_QUIT_CODE")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    process::exit(code);
}

fn run(mut mock: Mock) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    // Clients discard everything up to the first terminator
    mock.respond(&mut out, "-- mock radare2 ready\n")?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        let command = line.trim_end_matches('\r');
        if command == "q" || command == "q!" {
            drop(mock);
            quit();
        }
        let response = mock.handle(command)?;
        mock.respond(&mut out, &response)?;
    }

    // stdin closed without a quit command
    drop(mock);
    quit();
}

fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let mock = match Mock::open(args.target) {
        Ok(mock) => mock,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(mock) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            process::exit(0);
        }
        eprintln!("ERROR: {}", e);
        process::exit(1);
    }
}
