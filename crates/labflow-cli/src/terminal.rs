//! Interactive terminal: the researcher-facing resolver and the
//! `step.terminal` part type.

use labflow_core::{ConfigError, ConfigValues, PartRegistry};
use labflow_proto::{
    Outputs, Part, PartContext, PartError, PartId, PartOutput, PartResult, Resolution,
    ResolutionRequest, Resolver, Value,
};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// A line-oriented console shared by everything that talks to the researcher.
///
/// Clones share the same input and output, so a prompt from a part and a
/// prompt from the resolver never interleave.
#[derive(Clone)]
pub struct Console {
    input: Arc<Mutex<Box<dyn BufRead + Send>>>,
    output: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Arc::new(Mutex::new(Box::new(input))),
            output: Arc::new(Mutex::new(Box::new(output))),
        }
    }

    /// The process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }

    /// Writes `text` followed by a newline.
    pub fn say(&self, text: &str) -> io::Result<()> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(output, "{text}")?;
        output.flush()
    }

    /// Writes `text` without a newline and reads one line of input.
    ///
    /// Returns `None` at end of input. The trailing line break is removed.
    pub fn ask(&self, text: &str) -> io::Result<Option<String>> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        write!(output, "{text}")?;
        output.flush()?;

        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

/// Asks the researcher on the console.
///
/// Accepts the number of a listed part, a part's full identifier or its last
/// segment, `done` (leave the enclosing flow) or `quit` (end the
/// experiment). End of input defers the decision.
#[derive(Debug, Clone)]
pub struct TerminalResolver {
    console: Console,
}

impl TerminalResolver {
    pub fn new(console: Console) -> Self {
        Self { console }
    }

    fn show(&self, request: &ResolutionRequest) -> io::Result<()> {
        self.console.say("")?;
        self.console.say(&format!(
            "Part '{}' cannot continue ({}): {}",
            request.part_id, request.kind, request.failure_reason
        ))?;
        self.console.say("Choose how to continue:")?;
        for (i, part) in request.legal_choices.parts.iter().enumerate() {
            self.console.say(&format!("  {:>2}) {part}", i + 1))?;
        }
        if request.legal_choices.leave_flow {
            self.console.say(&format!("  {}  leave the enclosing flow", PartId::LEAVE_FLOW))?;
        }
        if request.legal_choices.end_experiment {
            self.console.say(&format!("  {}  end the experiment", PartId::TERMINAL))?;
        }
        Ok(())
    }

    fn prompt(&self, request: &ResolutionRequest) -> io::Result<Option<Resolution>> {
        self.show(request)?;
        loop {
            let Some(answer) = self.console.ask("> ")? else {
                debug!(part = %request.part_id, "End of input; deferring resolution");
                return Ok(None);
            };
            let answer = answer.trim();
            if answer.is_empty() {
                continue;
            }
            match parse_choice(request, answer) {
                Ok(resolution) => return Ok(Some(resolution)),
                Err(message) => self.console.say(&message)?,
            }
        }
    }
}

impl Resolver for TerminalResolver {
    fn resolve(&self, request: &ResolutionRequest) -> Option<Resolution> {
        match self.prompt(request) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(error = %e, "Console unavailable; deferring resolution");
                None
            }
        }
    }
}

fn parse_choice(request: &ResolutionRequest, answer: &str) -> Result<Resolution, String> {
    let choices = &request.legal_choices;
    let resolution = if answer == PartId::LEAVE_FLOW {
        Resolution::LeaveFlow
    } else if answer == PartId::TERMINAL {
        Resolution::EndExperiment
    } else if let Ok(n) = answer.parse::<usize>() {
        match n.checked_sub(1).and_then(|i| choices.parts.get(i)) {
            Some(part) => Resolution::Part {
                part_id: part.clone(),
            },
            None => return Err(format!("There is no choice {n}.")),
        }
    } else {
        let by_name: Vec<&PartId> = choices.parts.iter().filter(|p| p.name() == answer).collect();
        let part = match choices.parts.iter().find(|p| p.as_str() == answer) {
            Some(exact) => exact,
            None => match by_name.as_slice() {
                [only] => *only,
                [] => return Err(format!("'{answer}' is not one of the choices.")),
                _ => return Err(format!("'{answer}' is ambiguous; use the full name.")),
            },
        };
        Resolution::Part {
            part_id: part.clone(),
        }
    };

    if choices.allows(&resolution) {
        Ok(resolution)
    } else {
        Err(format!("'{answer}' is not allowed here."))
    }
}

/// Kind of value `step.terminal` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Str,
    Int,
    Float,
}

impl Entry {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "str" => Some(Entry::Str),
            "int" => Some(Entry::Int),
            "float" => Some(Entry::Float),
            _ => None,
        }
    }

    fn convert(self, text: &str) -> Option<Value> {
        match self {
            Entry::Str => Some(Value::from(text)),
            Entry::Int => text.trim().parse::<i64>().ok().map(Value::from),
            Entry::Float => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Entry::Str => "str",
            Entry::Int => "int",
            Entry::Float => "float",
        }
    }
}

/// `step.terminal`: shows a prompt and optionally reads a typed value.
///
/// `{name}` in the prompt is replaced by the bound input argument of that
/// name, or the store key of that name. With `enter`, the converted answer is
/// emitted as the result `value`; unparseable answers are asked again.
#[derive(Debug, Clone)]
pub struct TerminalStep {
    prompt: String,
    enter: Option<Entry>,
    console: Console,
}

impl TerminalStep {
    pub const TYPE_NAME: &'static str = "step.terminal";

    pub fn from_config(config: &ConfigValues<'_>, console: Console) -> Result<Self, ConfigError> {
        let prompt: String = config.get("prompt")?;
        let enter = match config.get_optional::<String>("enter")? {
            Some(name) => Some(Entry::parse(&name).ok_or_else(|| {
                config.invalid("enter", format!("unsupported input type '{name}' (str, int, float)"))
            })?),
            None => None,
        };
        Ok(Self {
            prompt,
            enter,
            console,
        })
    }

    /// Registers `step.terminal` against `console`.
    pub fn register(registry: &mut PartRegistry, console: Console) {
        registry.register_step(
            Self::TYPE_NAME,
            "Shows a prompt; with `enter`, reads a str, int or float into `value`",
            move |values| Ok(Arc::new(Self::from_config(values, console.clone())?)),
        );
    }

    fn render(&self, ctx: &PartContext<'_>) -> Result<String, PartError> {
        let mut text = String::with_capacity(self.prompt.len());
        let mut rest = self.prompt.as_str();
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            text.push_str(&rest[..open]);
            let name = &rest[open + 1..close];
            let value = placeholder(ctx, name)?;
            match value {
                Value::String(s) => text.push_str(&s),
                other => text.push_str(&other.to_string()),
            }
            rest = &rest[close + 1..];
        }
        text.push_str(rest);
        Ok(text)
    }
}

fn placeholder(ctx: &PartContext<'_>, name: &str) -> Result<Value, PartError> {
    if ctx.inputs.is_bound(name) {
        return ctx.inputs.require(name).cloned();
    }
    ctx.store.get(name).cloned().ok_or_else(|| {
        PartError::execution(format!("prompt refers to '{name}', which is neither an input nor in the data store"))
    })
}

impl Part for TerminalStep {
    fn execute(&self, ctx: &PartContext<'_>) -> PartResult {
        let text = self.render(ctx)?;
        let io_failure = |e: io::Error| PartError::execution(format!("console error: {e}"));

        let Some(entry) = self.enter else {
            self.console.say(&text).map_err(io_failure)?;
            return Ok(PartOutput::Outputs(Outputs::new()));
        };

        loop {
            let Some(answer) = self.console.ask(&text).map_err(io_failure)? else {
                return Err(PartError::execution("end of input while waiting for a value"));
            };
            if let Some(value) = entry.convert(&answer) {
                return Ok(PartOutput::Outputs(Outputs::new().with("value", value)));
            }
            self.console
                .say(&format!("Could not read '{answer}' as {}. Please try again.", entry.as_str()))
                .map_err(io_failure)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_proto::{FailureKind, Inputs, LegalChoices, StoreRead};
    use serde_json::json;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn console(input: &str) -> (Console, SharedBuf) {
        let out = SharedBuf::default();
        (Console::new(Cursor::new(input.to_string()), out.clone()), out)
    }

    fn request(leave_flow: bool) -> ResolutionRequest {
        ResolutionRequest {
            part_id: PartId::new("prep.weigh"),
            kind: FailureKind::PartExecutionFailure,
            failure_reason: "scale offline".to_string(),
            legal_choices: LegalChoices {
                parts: vec![PartId::new("prep.weigh"), PartId::new("prep.scale")],
                leave_flow,
                end_experiment: true,
            },
        }
    }

    struct NoStore;

    impl StoreRead for NoStore {
        fn get(&self, _key: &str) -> Option<&Value> {
            None
        }

        fn entries(&self) -> Vec<(String, Value)> {
            Vec::new()
        }
    }

    #[test]
    fn test_resolver_lists_choices() {
        let (console, out) = console("2\n");
        let resolution = TerminalResolver::new(console).resolve(&request(true));

        assert_eq!(resolution, Some(Resolution::part("prep.scale")));
        let text = out.text();
        assert!(text.contains("Part 'prep.weigh' cannot continue (PartExecutionFailure): scale offline"));
        assert!(text.contains(" 1) prep.weigh"));
        assert!(text.contains("done  leave the enclosing flow"));
        assert!(text.contains("quit  end the experiment"));
    }

    #[test]
    fn test_resolver_accepts_names_and_sentinels() {
        let cases = [
            ("scale\n", Some(Resolution::part("prep.scale"))),
            ("prep.weigh\n", Some(Resolution::part("prep.weigh"))),
            ("done\n", Some(Resolution::LeaveFlow)),
            ("quit\n", Some(Resolution::EndExperiment)),
        ];
        for (input, expected) in cases {
            let (console, _) = console(input);
            assert_eq!(TerminalResolver::new(console).resolve(&request(true)), expected, "{input:?}");
        }
    }

    #[test]
    fn test_resolver_reprompts_on_invalid_input() {
        let (console, out) = console("7\nmixer\ndone\n\nweigh\n");
        let resolution = TerminalResolver::new(console).resolve(&request(false));

        assert_eq!(resolution, Some(Resolution::part("prep.weigh")));
        let text = out.text();
        assert!(text.contains("There is no choice 7."));
        assert!(text.contains("'mixer' is not one of the choices."));
        assert!(text.contains("'done' is not allowed here."));
    }

    #[test]
    fn test_resolver_defers_at_end_of_input() {
        let (console, _) = console("bogus\n");
        assert_eq!(TerminalResolver::new(console).resolve(&request(true)), None);
    }

    #[test]
    fn test_terminal_step_prints_prompt() {
        let (console, out) = console("");
        let values = json!({"prompt": "Add {dose} ml, then press enter"});
        let step =
            TerminalStep::from_config(&ConfigValues::new("say", values.as_object().unwrap()), console)
                .unwrap();

        let inputs = Inputs::new().with("dose", 0.5);
        let ctx = PartContext {
            part_id: &PartId::new("say"),
            inputs: &inputs,
            store: &NoStore,
        };
        let output = step.execute(&ctx).unwrap();

        assert_eq!(output, PartOutput::Outputs(Outputs::new()));
        assert_eq!(out.text(), "Add 0.5 ml, then press enter\n");
    }

    #[test]
    fn test_terminal_step_reads_typed_value() {
        let (console, out) = console("seven\n7.25\n");
        let values = json!({"prompt": "pH? ", "enter": "float"});
        let step =
            TerminalStep::from_config(&ConfigValues::new("read", values.as_object().unwrap()), console)
                .unwrap();

        let inputs = Inputs::new();
        let ctx = PartContext {
            part_id: &PartId::new("read"),
            inputs: &inputs,
            store: &NoStore,
        };
        let output = step.execute(&ctx).unwrap();

        assert_eq!(
            output,
            PartOutput::Outputs(Outputs::new().with("value", 7.25))
        );
        assert!(out.text().contains("Could not read 'seven' as float."));
    }

    #[test]
    fn test_terminal_step_fails_at_end_of_input() {
        let (console, _) = console("");
        let values = json!({"prompt": "count? ", "enter": "int"});
        let step =
            TerminalStep::from_config(&ConfigValues::new("read", values.as_object().unwrap()), console)
                .unwrap();

        let inputs = Inputs::new();
        let ctx = PartContext {
            part_id: &PartId::new("read"),
            inputs: &inputs,
            store: &NoStore,
        };
        let err = step.execute(&ctx).unwrap_err();
        assert_eq!(err.kind, FailureKind::PartExecutionFailure);
    }

    #[test]
    fn test_unknown_entry_type_is_config_error() {
        let (console, _) = console("");
        let values = json!({"prompt": "?", "enter": "date"});
        let err =
            TerminalStep::from_config(&ConfigValues::new("read", values.as_object().unwrap()), console)
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfigValue { .. }));
    }
}
