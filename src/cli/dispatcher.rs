use bytes::Bytes;

use crate::{
    datapoint::{decode_text, encode_json, encode_text, now_micros, Datapoint, WireFormat},
    engine::{Caller, Engine, Scope, SessionRef},
    event::{encode_params, META_EVENT},
    timer::Repeat,
    VERSION,
};

use super::{
    error::DispatchError,
    model::{CliCommands, Command, EvtPutArgs},
    script::strip_group,
};

impl Command {
    /// Executes one command on the engine thread
    pub fn dispatch(self, engine: &mut Engine, caller: &Caller) -> Result<String, DispatchError> {
        match self {
            Command::Set(text) => {
                let dp = stamped(decode_text(&text)?);
                engine.publish(dp)?;
                Ok(String::new())
            }
            Command::Eval(script) => engine
                .run_script(strip_group(&script), caller)
                .map_err(DispatchError::into_execution),
            Command::Cli(cmd) => cmd.dispatch(engine, caller),
        }
    }
}

fn stamped(dp: Datapoint) -> Datapoint {
    if dp.timestamp == 0 {
        dp.restamped(now_micros())
    } else {
        dp
    }
}

fn flag(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

fn timer_id(v: i64) -> Result<usize, DispatchError> {
    usize::try_from(v).map_err(|_| DispatchError::InvalidArgument(format!("invalid timer {v}")))
}

fn session(caller: &Caller) -> Result<&SessionRef, DispatchError> {
    if caller.scope == Scope::Store {
        return Err(DispatchError::Execution(
            "client commands are not available in store scripts".to_string(),
        ));
    }
    caller
        .session
        .as_ref()
        .ok_or_else(|| DispatchError::Execution("command needs a client connection".to_string()))
}

impl CliCommands {
    fn dispatch(self, engine: &mut Engine, caller: &Caller) -> Result<String, DispatchError> {
        Ok(match self {
            CliCommands::Get(arg) => {
                let dp = engine.store.get(&arg.name)?;
                let format = caller
                    .session
                    .as_ref()
                    .map(|s| s.format.get())
                    .unwrap_or_default();
                match format {
                    WireFormat::Json => encode_json(&dp, &engine.events)?,
                    WireFormat::Text | WireFormat::Binary => encode_text(&dp),
                }
            }
            CliCommands::Touch(arg) => {
                engine.store.touch(&arg.name)?;
                String::new()
            }
            CliCommands::Clear(arg) => {
                engine.store.clear(&arg.name)?;
                String::new()
            }
            CliCommands::Exists(arg) => flag(engine.store.exists(&arg.name)),
            CliCommands::Copy { from, to } => {
                engine.store.copy(&from, &to)?;
                String::new()
            }
            CliCommands::GetSize(arg) => engine.store.get(&arg.name)?.payload.len().to_string(),
            CliCommands::Keys => engine.store.keys().join(" "),
            CliCommands::DgDir => engine.store.dg_dir(),

            CliCommands::EvtPut(args) => {
                let dp = evtput(engine, args)?;
                engine.store.set(dp)?;
                String::new()
            }
            CliCommands::EvtNameSet {
                e_type,
                name,
                put_type,
            } => {
                let dp = engine.events.name_event(e_type, &name, put_type)?;
                engine.store.set(dp)?;
                String::new()
            }

            CliCommands::TimerTick(args) => {
                let (id, ms) = match args.values[..] {
                    [ms] => (0, ms),
                    [id, ms] => (timer_id(id)?, ms),
                    _ => return Err(DispatchError::Parse("expected `[id] ms`".to_string())),
                };
                engine.timers.tick(id, ms)?;
                id.to_string()
            }
            CliCommands::TimerTickInterval(args) => {
                let (id, start, interval, repeat) = match args.values[..] {
                    [start, interval] => (0, start, interval, Repeat::Forever),
                    [id, start, interval] => (timer_id(id)?, start, interval, Repeat::Forever),
                    [id, start, interval, repeat] => {
                        (timer_id(id)?, start, interval, Repeat::from_count(repeat)?)
                    }
                    _ => {
                        return Err(DispatchError::Parse(
                            "expected `[id] start interval [repeat]`".to_string(),
                        ))
                    }
                };
                engine.timers.tick_interval(id, start, interval, repeat)?;
                id.to_string()
            }
            CliCommands::TimerExpired { id } => flag(engine.timers.expired(id.unwrap_or(0))?),
            CliCommands::TimerReset { id } => {
                match id {
                    Some(id) => engine.timers.reset(id)?,
                    None => engine.timers.reset_all(),
                }
                String::new()
            }
            CliCommands::TimerStatus => engine
                .timers
                .status()
                .into_iter()
                .map(flag)
                .collect::<Vec<_>>()
                .join(" "),
            CliCommands::TimerSetPrefix { prefix } => {
                if prefix.is_empty() {
                    return Err(DispatchError::InvalidArgument("empty timer prefix".to_string()));
                }
                engine.timers.set_prefix(&prefix);
                String::new()
            }
            CliCommands::TimerSetScript { id, script } => {
                engine.set_timer_script(id, script.join(" "))?;
                String::new()
            }
            CliCommands::TimerRemoveScript { id } => {
                if !engine.remove_timer_script(id) {
                    return Err(DispatchError::NotFound(format!("timer {id} has no script")));
                }
                String::new()
            }

            CliCommands::DpointSetScript {
                pattern,
                every,
                script,
            } => {
                engine.set_trigger(&pattern, every, script.join(" "))?;
                String::new()
            }
            CliCommands::DpointRemoveScript { pattern } => {
                if !engine.remove_trigger(&pattern) {
                    return Err(DispatchError::NotFound(format!("no script for `{pattern}`")));
                }
                String::new()
            }
            CliCommands::DpointRemoveAllScripts => {
                engine.remove_all_triggers();
                String::new()
            }

            CliCommands::Now => now_micros().to_string(),
            CliCommands::Version => VERSION.to_string(),

            other => return other.dispatch_session(engine, session(caller)?),
        })
    }

    fn dispatch_session(self, engine: &Engine, session: &SessionRef) -> Result<String, DispatchError> {
        let store = &engine.store;
        Ok(match self {
            CliCommands::AddMatch { pattern, stride } => {
                store.subscribe(&session.id, &pattern, stride)?;
                String::new()
            }
            CliCommands::RemoveMatch { pattern } => {
                if !store.unsubscribe(&session.id, &pattern)? {
                    return Err(DispatchError::NotFound(format!("no match `{pattern}`")));
                }
                String::new()
            }
            CliCommands::RemoveAllMatches => {
                store.unsubscribe_all(&session.id)?;
                String::new()
            }
            CliCommands::Matches => store
                .matches(&session.id)?
                .iter()
                .map(|(pattern, stride)| format!("{pattern} {stride}"))
                .collect::<Vec<_>>()
                .join("; "),
            CliCommands::Format { format } => {
                session.format.set(format);
                String::new()
            }
            other => return Err(DispatchError::Execution(format!("{other:?} is not a client command"))),
        })
    }
}

fn evtput(engine: &Engine, args: EvtPutArgs) -> Result<Datapoint, DispatchError> {
    // meta events carry their time encoding and put type in the timestamp
    let timestamp = match (args.timestamp, args.e_type) {
        (0, META_EVENT) => {
            return Err(DispatchError::InvalidArgument(
                "meta events need a timestamp holding the name layout".to_string(),
            ))
        }
        (0, _) => now_micros(),
        (ts, _) => ts,
    };
    let params = match args.put_type {
        Some(put_type) => encode_params(put_type, &args.params)?,
        None if args.params.is_empty() => Bytes::new(),
        None => {
            return Err(DispatchError::InvalidArgument(
                "event parameters need a put type".to_string(),
            ))
        }
    };
    Ok(engine
        .events
        .to_datapoint(args.e_type, args.subtype, timestamp, args.put_type, params)?)
}
