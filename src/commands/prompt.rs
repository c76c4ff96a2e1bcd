use std::io::{self, BufRead, Write};

/// Print `question` and read one trimmed line from stdin. EOF reads as empty.
pub fn ask(question: &str) -> io::Result<String> {
    print!("{question} ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
