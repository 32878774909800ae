// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `stream_select` and `stream_socket_pair`.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::time::Duration;

use splice_rt::{in_task, poll_fds, PollFd, SocketKind};

use super::{arg, int_arg, with_refs};
use crate::error::CallError;
use crate::stream::{CastAs, SocketStream, StreamCell, StreamRef};
use crate::table::Handler;
use crate::value::Value;

fn streams(routine: &str, value: &Value) -> Result<Vec<StreamRef>, CallError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::List(items) => items
            .iter()
            .map(|v| {
                v.as_stream()
                    .cloned()
                    .ok_or_else(|| {
                        CallError::invalid(routine, format!("cannot select on a {}", v.type_name()))
                    })
            })
            .collect(),
        other => Err(CallError::invalid(
            routine,
            format!("stream arrays must be lists, got {}", other.type_name()),
        )),
    }
}

fn list(streams: Vec<StreamRef>) -> Value {
    Value::List(streams.into_iter().map(Value::Stream).collect())
}

fn refused(message: &str) -> Value {
    tracing::warn!(routine = "stream_select", "{}", message);
    Value::Bool(false)
}

async fn select(args: Vec<Value>) -> Result<Value, CallError> {
    const NAME: &str = "stream_select";
    let read = streams(NAME, arg(&args, 0))?;
    let write = streams(NAME, arg(&args, 1))?;
    let except = streams(NAME, arg(&args, 2))?;

    let timeout = if arg(&args, 3).is_null() {
        None
    } else {
        let sec = int_arg(NAME, &args, 3)?;
        let usec = if arg(&args, 4).is_null() { 0 } else { int_arg(NAME, &args, 4)? };
        if sec < 0 {
            return Ok(refused("The seconds parameter must be greater than 0"));
        }
        if usec < 0 {
            return Ok(refused("The microseconds parameter must be greater than 0"));
        }
        Some(Duration::from_secs(sec as u64).saturating_add(Duration::from_micros(usec as u64)))
    };

    if read.is_empty() && write.is_empty() && except.is_empty() {
        return Ok(refused("No stream arrays were passed"));
    }

    // Data already sitting in a read buffer makes the call ready at once.
    let mut buffered = Vec::new();
    for stream in &read {
        if stream.lock().await.buffered() > 0 {
            buffered.push(stream.clone());
        }
    }
    if !buffered.is_empty() {
        let count = buffered.len() as i64;
        return Ok(with_refs(
            Value::Int(count),
            vec![("read", list(buffered)), ("write", list(vec![])), ("except", list(vec![]))],
        ));
    }

    let mut fds = Vec::with_capacity(read.len() + write.len() + except.len());
    let sets = [
        (&read, (true, false, false)),
        (&write, (false, true, false)),
        (&except, (false, false, true)),
    ];
    for (set, (r, w, e)) in sets {
        for stream in set {
            let fd = stream
                .lock()
                .await
                .cast(CastAs::FdForSelect)
                .map_err(|e| CallError::stream(NAME, e))?;
            fds.push(PollFd {
                fd,
                read: r,
                write: w,
                except: e,
            });
        }
    }

    let ready = poll_fds(&fds, timeout)
        .await
        .map_err(|e| CallError::stream(NAME, e.into()))?;

    let mut flags = ready.iter();
    let mut keep = |set: Vec<StreamRef>| -> Vec<StreamRef> {
        set.into_iter()
            .filter(|_| flags.next().is_some_and(|r| r.any()))
            .collect()
    };
    let read = keep(read);
    let write = keep(write);
    let except = keep(except);
    let count = (read.len() + write.len() + except.len()) as i64;
    Ok(with_refs(
        Value::Int(count),
        vec![("read", list(read)), ("write", list(write)), ("except", list(except))],
    ))
}

/// `stream_select(&$read, &$write, &$except, ?int $sec, int $usec = 0)`
pub fn stream_select(original: Handler) -> Handler {
    Handler::new(move |args| {
        let original = original.clone();
        async move {
            if !in_task() {
                return original.call(args).await;
            }
            select(args).await
        }
    })
}

fn socket_pair(domain: i32, ty: i32, protocol: i32) -> io::Result<(OwnedFd, OwnedFd, SocketKind)> {
    let kind = match (domain, ty) {
        (libc::AF_UNIX, libc::SOCK_STREAM) => SocketKind::UnixStream,
        (libc::AF_UNIX, libc::SOCK_DGRAM) => SocketKind::UnixDgram,
        _ => return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
    };
    let mut fds = [0; 2];
    let ty = ty | libc::SOCK_CLOEXEC;
    let ret = unsafe { libc::socketpair(domain, ty, protocol, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair just returned two fresh descriptors.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((pair.0, pair.1, kind))
}

/// `stream_socket_pair(int $domain, int $type, int $protocol)`: both ends
/// come back as bridge streams carrying the default socket timeout.
pub fn stream_socket_pair(original: Handler, timeout: Option<Duration>) -> Handler {
    Handler::new(move |args| {
        let original = original.clone();
        async move {
            if !in_task() {
                return original.call(args).await;
            }
            const NAME: &str = "stream_socket_pair";
            let domain = int_arg(NAME, &args, 0)? as i32;
            let ty = int_arg(NAME, &args, 1)? as i32;
            let protocol = int_arg(NAME, &args, 2)? as i32;

            let ends = socket_pair(domain, ty, protocol).and_then(|(a, b, kind)| {
                Ok((
                    SocketStream::from_fd(a, kind, timeout)?,
                    SocketStream::from_fd(b, kind, timeout)?,
                ))
            });
            match ends {
                Ok((a, b)) => Ok(Value::List(vec![
                    Value::Stream(StreamCell::new(a)),
                    Value::Stream(StreamCell::new(b)),
                ])),
                Err(e) => {
                    tracing::warn!(routine = NAME, error = %e, "failed to create sockets");
                    Ok(Value::Bool(false))
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::fd::{pipe, FdStream};
    use splice_rt::{Worker, WorkerCensus};

    fn never() -> Handler {
        Handler::sync(|_| Err(CallError::failed("original", "should not run")))
    }

    fn call(h: Handler, args: Vec<Value>) -> Result<Value, CallError> {
        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        worker.block_on(h.call(args))
    }

    fn field(v: &Value, key: &str) -> Value {
        match v {
            Value::Map(m) => m.get(key).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    #[test]
    fn no_streams_is_refused() {
        let out = call(
            stream_select(never()),
            vec![Value::List(vec![]), Value::Null, Value::Null, Value::Int(0)],
        );
        assert_eq!(out, Ok(Value::Bool(false)));
    }

    #[test]
    fn negative_timeout_is_refused() {
        let (r, _w) = pipe().unwrap();
        let s = StreamCell::new(FdStream::owned(r, false).unwrap());
        let out = call(
            stream_select(never()),
            vec![Value::List(vec![Value::Stream(s)]), Value::Null, Value::Null, Value::Int(-1)],
        );
        assert_eq!(out, Ok(Value::Bool(false)));
    }

    #[test]
    fn reports_only_ready_streams() {
        let (r1, w1) = pipe().unwrap();
        let (r2, _w2) = pipe().unwrap();
        let idle = StreamCell::new(FdStream::owned(r2, false).unwrap());
        let ready = StreamCell::new(FdStream::owned(r1, false).unwrap());
        let writer = StreamCell::new(FdStream::owned(w1, false).unwrap());
        splice_rt::block_on(writer.write(b"x")).unwrap();

        let out = call(
            stream_select(never()),
            vec![
                Value::List(vec![Value::Stream(idle), Value::Stream(ready.clone())]),
                Value::List(vec![Value::Stream(writer.clone())]),
                Value::Null,
                Value::Int(0),
                Value::Int(0),
            ],
        )
        .unwrap();
        assert_eq!(field(&out, "return"), Value::Int(2));
        assert_eq!(field(&out, "read"), Value::List(vec![Value::Stream(ready)]));
        assert_eq!(field(&out, "write"), Value::List(vec![Value::Stream(writer)]));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let (r, w) = pipe().unwrap();
        let ready = StreamCell::new(FdStream::owned(r, false).unwrap());
        let writer = StreamCell::new(FdStream::owned(w, false).unwrap());
        splice_rt::block_on(writer.write(b"x")).unwrap();

        let out = call(
            stream_select(never()),
            vec![
                Value::List(vec![Value::Stream(ready.clone())]),
                Value::Null,
                Value::Null,
                Value::Int(i64::MAX),
                Value::Int(i64::MAX),
            ],
        )
        .unwrap();
        assert_eq!(field(&out, "return"), Value::Int(1));
        assert_eq!(field(&out, "read"), Value::List(vec![Value::Stream(ready)]));
    }

    #[test]
    fn timeout_returns_zero() {
        let (r, _w) = pipe().unwrap();
        let s = StreamCell::new(FdStream::owned(r, false).unwrap());
        let out = call(
            stream_select(never()),
            vec![
                Value::List(vec![Value::Stream(s)]),
                Value::Null,
                Value::Null,
                Value::Int(0),
                Value::Int(1000),
            ],
        )
        .unwrap();
        assert_eq!(field(&out, "return"), Value::Int(0));
        assert_eq!(field(&out, "read"), Value::List(vec![]));
    }

    #[test]
    fn socket_pair_ends_talk() {
        let pair = call(
            stream_socket_pair(never(), Some(Duration::from_secs(5))),
            vec![
                Value::Int(libc::AF_UNIX as i64),
                Value::Int(libc::SOCK_STREAM as i64),
                Value::Int(0),
            ],
        )
        .unwrap();
        let Value::List(ends) = pair else { panic!("expected two streams") };
        let (a, b) = (ends[0].as_stream().unwrap().clone(), ends[1].as_stream().unwrap().clone());
        assert_eq!(a.label(), "unix_socket/coroutine");

        let worker = Worker::with_census(&WorkerCensus::new()).unwrap();
        let got = worker.block_on(async move {
            a.write(b"ping").await.unwrap();
            b.read(16).await.unwrap()
        });
        assert_eq!(got, b"ping");
    }

    #[test]
    fn unsupported_domain_returns_false() {
        let out = call(
            stream_socket_pair(never(), None),
            vec![
                Value::Int(libc::AF_INET as i64),
                Value::Int(libc::SOCK_STREAM as i64),
                Value::Int(0),
            ],
        );
        assert_eq!(out, Ok(Value::Bool(false)));
    }
}
