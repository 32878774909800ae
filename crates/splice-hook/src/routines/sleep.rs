// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `sleep`, `usleep`, `time_nanosleep`, `time_sleep_until`.
//!
//! Inside a task these park the task on a timer. Elsewhere the original
//! routine runs and blocks the thread as it always did.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use splice_rt::in_task;

use super::{float_arg, int_arg};
use crate::error::CallError;
use crate::table::Handler;
use crate::value::Value;

/// What a validated call should do.
#[derive(Debug, PartialEq)]
enum Nap {
    Sleep(Duration, Value),
    /// Argument rejected; the warning has been logged.
    Refuse,
}

fn refuse(routine: &str, message: &str) -> Nap {
    tracing::warn!(routine, "{}", message);
    Nap::Refuse
}

fn sleep(args: &[Value]) -> Result<Nap, CallError> {
    let secs = int_arg("sleep", args, 0)?;
    if secs < 0 {
        return Ok(refuse("sleep", "Number of seconds must be greater than or equal to 0"));
    }
    Ok(Nap::Sleep(Duration::from_secs(secs as u64), Value::Int(0)))
}

fn usleep(args: &[Value]) -> Result<Nap, CallError> {
    let micros = int_arg("usleep", args, 0)?;
    if micros < 0 {
        return Ok(refuse("usleep", "Number of microseconds must be greater than or equal to 0"));
    }
    Ok(Nap::Sleep(Duration::from_micros(micros as u64), Value::Null))
}

fn time_nanosleep(args: &[Value]) -> Result<Nap, CallError> {
    let secs = int_arg("time_nanosleep", args, 0)?;
    let nanos = int_arg("time_nanosleep", args, 1)?;
    if secs < 0 {
        return Ok(refuse("time_nanosleep", "The seconds value must be greater than 0"));
    }
    if nanos < 0 {
        return Ok(refuse("time_nanosleep", "The nanoseconds value must be greater than 0"));
    }
    let duration =
        Duration::from_secs(secs as u64).saturating_add(Duration::from_nanos(nanos as u64));
    Ok(Nap::Sleep(duration, Value::Bool(true)))
}

fn time_sleep_until(args: &[Value], now: SystemTime) -> Result<Nap, CallError> {
    let target = float_arg("time_sleep_until", args, 0)?;
    let now = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    let remaining = target - now;
    if !remaining.is_finite() || remaining < 0.0 {
        return Ok(refuse("time_sleep_until", "Sleep until to time is less than current time"));
    }
    let duration = Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX);
    Ok(Nap::Sleep(duration, Value::Bool(true)))
}

pub fn handler(name: &str, original: Handler) -> Option<Handler> {
    let validate: fn(&[Value]) -> Result<Nap, CallError> = match name {
        "sleep" => sleep,
        "usleep" => usleep,
        "time_nanosleep" => time_nanosleep,
        "time_sleep_until" => |args| time_sleep_until(args, SystemTime::now()),
        _ => return None,
    };
    Some(Handler::new(move |args| {
        let original = original.clone();
        async move {
            if !in_task() {
                return original.call(args).await;
            }
            match validate(&args)? {
                Nap::Sleep(duration, result) => {
                    splice_rt::sleep(duration).await;
                    Ok(result)
                }
                Nap::Refuse => Ok(Value::Bool(false)),
            }
        }
    }))
}
