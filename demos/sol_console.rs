use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use ipmi_console::{Engine, EngineConfig, PrivilegeLevel, SessionConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Example:
    //   cargo run --example sol_console -- bmc.example.net:623 admin password
    //
    // Type `~B` at the start of a line to send a serial break; end input to quit.
    let mut args = std::env::args().skip(1);
    let target = args.next().ok_or("missing <host:port>")?;
    let username = args.next().ok_or("missing <username>")?;
    let password = args.next().ok_or("missing <password>")?;

    let engine = Engine::new(EngineConfig::default());
    engine.setup(1)?;
    engine.thread_create()?;

    let config = SessionConfig::resolve(target.as_str())?
        .username(username)
        .password(password)
        .privilege_level(PrivilegeLevel::Administrator)
        .deactivate_if_active(true)
        .build()?;
    let mut handle = engine.open(config)?;
    handle.wait_established(Duration::from_secs(30))?;
    eprintln!("[SOL established]");

    let mut output = handle.stream().ok_or("console stream taken")?.try_clone()?;
    let printer = thread::spawn(move || {
        let mut buf = [0u8; 1024];
        let mut stdout = std::io::stdout();
        while let Ok(n) = output.read(&mut buf) {
            if n == 0 || stdout.write_all(&buf[..n]).is_err() {
                break;
            }
            let _ = stdout.flush();
        }
    });

    let mut input = handle.stream().ok_or("console stream taken")?;
    for line in std::io::stdin().lines() {
        let line = line?;
        if line == "~B" {
            handle.generate_break()?;
            continue;
        }
        input.write_all(line.as_bytes())?;
        input.write_all(b"\r")?;
    }

    handle.close()?;
    let _ = printer.join();
    handle.wait_exited(Duration::from_secs(10));
    match handle.error_code() {
        Some(code) => eprintln!("[SOL closed: {code}]"),
        None => eprintln!("[SOL closed]"),
    }

    engine.cleanup(true);
    Ok(())
}
