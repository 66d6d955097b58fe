//! Operator word grammar
//!
//! Turns a line such as `vm net connect web[1-3] 0 red` into a [`Command`]
//! with named arguments. Each arm below is one command pattern.

use vmfleet_core::{Command, FleetError, FleetResult};

/// Splits a line into words. Single or double quotes group words.
pub fn tokenize(line: &str) -> FleetResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(FleetError::invalid_input("command", "unterminated quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Matches words against the known command patterns
pub fn parse_command(words: &[String]) -> FleetResult<Command> {
    let w: Vec<&str> = words.iter().map(String::as_str).collect();

    let cmd = match w.as_slice() {
        ["vm", "info", columns @ ..] => {
            Command::new("vm info").list("columns", columns.iter().copied())
        }
        ["vm", "summary"] => Command::new("vm summary"),
        ["vm", "launch", kind, name] => {
            Command::new("vm launch").arg("kind", *kind).arg("name", *name)
        }
        ["vm", "launch", kind, name, "noblock"] => Command::new("vm launch")
            .arg("kind", *kind)
            .arg("name", *name)
            .flag("noblock"),
        ["vm", op @ ("start" | "stop" | "kill"), target] => {
            Command::new(format!("vm {}", op)).arg("target", *target)
        }
        ["vm", "flush"] => Command::new("vm flush"),

        ["vm", "tag", target] => Command::new("vm tag").arg("target", *target),
        ["vm", "tag", target, key] => Command::new("vm tag").arg("target", *target).arg("key", *key),
        ["vm", "tag", target, key, value] => Command::new("vm tag")
            .arg("target", *target)
            .arg("key", *key)
            .arg("value", *value),
        ["clear", "vm", "tag", target] => Command::new("clear vm tag").arg("target", *target),
        ["clear", "vm", "tag", target, key] => Command::new("clear vm tag")
            .arg("target", *target)
            .arg("key", *key),

        ["vm", "net", "connect", target, position, vlan] => Command::new("vm net connect")
            .arg("target", *target)
            .arg("position", *position)
            .arg("vlan", *vlan),
        ["vm", "net", "connect", target, position, vlan, bridge] => {
            Command::new("vm net connect")
                .arg("target", *target)
                .arg("position", *position)
                .arg("vlan", *vlan)
                .arg("bridge", *bridge)
        }
        ["vm", "net", "disconnect", target, position] => Command::new("vm net disconnect")
            .arg("target", *target)
            .arg("position", *position),

        ["vm", "config", "save"] => Command::new("vm config save"),
        ["vm", "config", "save", name] => Command::new("vm config save").arg("name", *name),
        ["vm", "config", "restore", name] => {
            Command::new("vm config restore").arg("name", *name)
        }
        ["vm", "config"] => Command::new("vm config"),
        ["vm", "config", field, values @ ..] => Command::new("vm config")
            .arg("field", *field)
            .list("value", values.iter().copied()),
        ["clear", "vm", "config"] => Command::new("clear vm config"),

        ["namespace"] => Command::new("namespace"),
        ["namespace", name] => Command::new("namespace").arg("name", *name),
        ["clear", "namespace"] => Command::new("clear namespace"),
        ["clear", "namespace", name] => Command::new("clear namespace").arg("name", *name),
        ["vlans"] => Command::new("vlans"),
        ["metrics"] => Command::new("metrics"),

        ["vm", "qmp", target, json @ ..] if !json.is_empty() => Command::new("vm qmp")
            .arg("target", *target)
            .arg("json", json.join(" ")),
        ["vm", "hotplug", "add", target, file] => Command::new("vm hotplug add")
            .arg("target", *target)
            .arg("file", *file),
        ["vm", "hotplug", "remove", target, id] => Command::new("vm hotplug remove")
            .arg("target", *target)
            .arg("id", *id),
        ["vm", "hotplug", "show", target] => {
            Command::new("vm hotplug show").arg("target", *target)
        }
        ["vm", "cdrom", "change", target, file] => Command::new("vm cdrom change")
            .arg("target", *target)
            .arg("file", *file),
        ["vm", "cdrom", "eject", target] => {
            Command::new("vm cdrom eject").arg("target", *target)
        }

        _ => {
            return Err(FleetError::invalid_input(
                "command",
                format!("no matching command: {}", words.join(" ")),
            ))
        }
    };

    Ok(cmd.source("cli"))
}

/// Tokenizes and parses one line
pub fn parse_line(line: &str) -> FleetResult<Command> {
    parse_command(&tokenize(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"vm qmp web '{"execute": "stop"}'"#).unwrap(),
            vec!["vm", "qmp", "web", r#"{"execute": "stop"}"#]
        );
        assert_eq!(tokenize("  vm   info ").unwrap(), vec!["vm", "info"]);
        assert_eq!(tokenize(r#"vm tag a note """#).unwrap(), vec!["vm", "tag", "a", "note", ""]);
        assert!(tokenize("vm tag 'open").is_err());
    }

    #[test_case("vm info", "vm info"; "info")]
    #[test_case("vm start web[1-3]", "vm start"; "start")]
    #[test_case("vm kill all", "vm kill"; "kill")]
    #[test_case("clear vm tag all role", "clear vm tag"; "clear tag")]
    #[test_case("vm config save base", "vm config save"; "save")]
    #[test_case("vm config memory 4096", "vm config"; "config field")]
    #[test_case("clear namespace lab", "clear namespace"; "clear namespace")]
    #[test_case("vm hotplug remove web all", "vm hotplug remove"; "hotplug remove")]
    fn test_patterns(line: &str, pattern: &str) {
        assert_eq!(parse_line(line).unwrap().pattern, pattern);
    }

    #[test]
    fn test_arguments() {
        let cmd = parse_line("vm launch kvm foo[0-2] noblock").unwrap();
        assert_eq!(cmd.string_arg("kind"), Some("kvm"));
        assert_eq!(cmd.string_arg("name"), Some("foo[0-2]"));
        assert!(cmd.bool_arg("noblock"));
        assert_eq!(cmd.source, "cli");

        let cmd = parse_line("vm net connect web 0 red br1").unwrap();
        assert_eq!(cmd.string_arg("position"), Some("0"));
        assert_eq!(cmd.string_arg("vlan"), Some("red"));
        assert_eq!(cmd.string_arg("bridge"), Some("br1"));

        let cmd = parse_line("vm config net 100 br0,200").unwrap();
        assert_eq!(cmd.string_arg("field"), Some("net"));
        assert_eq!(cmd.list_arg("value"), &["100".to_string(), "br0,200".to_string()]);

        let cmd = parse_line("vm info name state").unwrap();
        assert_eq!(cmd.list_arg("columns"), &["name".to_string(), "state".to_string()]);
    }

    #[test]
    fn test_unknown_words() {
        let err = parse_line("vm frobnicate").unwrap_err();
        assert_eq!(err.to_string(), "invalid command: no matching command: vm frobnicate");
        assert!(parse_line("vm qmp web").is_err());
    }
}
