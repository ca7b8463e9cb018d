/// One line typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Quit,
    Reconnect,
    State,
    Message { text: String, sentiment: Option<f64> },
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message { text: line.to_string(), sentiment: None };
    };

    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    match name {
        "quit" | "exit" => Input::Quit,
        "reconnect" => Input::Reconnect,
        "state" => Input::State,
        "sentiment" => {
            let rest = rest.trim();
            let (score, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let score = match score.parse::<f64>() {
                Ok(s) if (-1.0..=1.0).contains(&s) => s,
                _ => return Input::Invalid(format!("sentiment must be a number in [-1, 1], got {:?}", score)),
            };
            let text = text.trim();
            if text.is_empty() {
                return Input::Invalid("usage: /sentiment <score> <text>".to_string());
            }
            Input::Message { text: text.to_string(), sentiment: Some(score) }
        }
        other => Input::Invalid(format!("unknown command /{}", other)),
    }
}
