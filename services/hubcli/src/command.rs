// Command language of the interactive client:
//   `! <port>`            enter
//   `. <port>`            exit
//   `<port> ! <message>`  send
//   `q`                   quit
// A trailing `XXX` cancels the line; an empty line is invalid.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enter { port: u32 },
    Exit { port: u32 },
    Send { port: u32, body: String },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Command(Command),
    Cancelled,
    Invalid,
}

pub fn parse(line: &str) -> ParseOutcome {
    if line.is_empty() {
        return ParseOutcome::Invalid;
    }
    if line.ends_with("XXX") {
        return ParseOutcome::Cancelled;
    }
    if line == "q" {
        return ParseOutcome::Command(Command::Quit);
    }
    if let Some(command) = parse_send(line)
        .or_else(|| parse_enter(line))
        .or_else(|| parse_exit(line))
    {
        return ParseOutcome::Command(command);
    }
    ParseOutcome::Invalid
}

fn parse_send(line: &str) -> Option<Command> {
    let (port, rest) = line.split_once(' ')?;
    let (bang, body) = rest.split_once(' ')?;
    if bang != "!" {
        return None;
    }
    Some(Command::Send {
        port: port.parse().ok()?,
        body: body.to_string(),
    })
}

fn parse_enter(line: &str) -> Option<Command> {
    let (bang, port) = line.split_once(' ')?;
    if bang != "!" {
        return None;
    }
    Some(Command::Enter {
        port: port.parse().ok()?,
    })
}

fn parse_exit(line: &str) -> Option<Command> {
    let (dot, port) = line.split_once(' ')?;
    if dot != "." {
        return None;
    }
    Some(Command::Exit {
        port: port.parse().ok()?,
    })
}
