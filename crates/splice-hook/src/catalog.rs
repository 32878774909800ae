// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Names of the routines each category redirects.

/// Companion routines for the script form live under this prefix.
pub const SCRIPT_PREFIX: &str = "swoole_";
/// Companion routines for the native form live under this prefix.
pub const NATIVE_PREFIX: &str = "swoole_native_";

pub const STREAM_FUNCTION: &[&str] = &["stream_select", "stream_socket_pair"];

pub const SLEEP: &[&str] = &["sleep", "usleep", "time_nanosleep", "time_sleep_until"];

pub const PROC: &[&str] = &["proc_open", "proc_close", "proc_get_status", "proc_terminate"];

/// Blocking routines with a built-in cooperative replacement.
pub const BLOCKING_NATIVE: &[&str] = &["gethostbyname"];
/// Blocking routines redirected to script companions.
pub const BLOCKING_SCRIPT: &[&str] = &["exec", "shell_exec"];

pub const SOCKET: &[&str] = &[
    "socket_create",
    "socket_create_listen",
    "socket_create_pair",
    "socket_connect",
    "socket_write",
    "socket_read",
    "socket_send",
    "socket_recv",
    "socket_sendto",
    "socket_recvfrom",
    "socket_bind",
    "socket_listen",
    "socket_accept",
    "socket_getpeername",
    "socket_getsockname",
    "socket_getopt",
    "socket_get_option",
    "socket_setopt",
    "socket_set_option",
    "socket_set_block",
    "socket_set_nonblock",
    "socket_shutdown",
    "socket_close",
    "socket_clear_error",
    "socket_last_error",
    "socket_import_stream",
];

pub const HTTP_NATIVE: &[&str] = &[
    "curl_close",
    "curl_copy_handle",
    "curl_errno",
    "curl_error",
    "curl_exec",
    "curl_getinfo",
    "curl_init",
    "curl_setopt",
    "curl_setopt_array",
    "curl_reset",
    "curl_pause",
    "curl_escape",
    "curl_unescape",
    "curl_multi_init",
    "curl_multi_add_handle",
    "curl_multi_exec",
    "curl_multi_errno",
    "curl_multi_select",
    "curl_multi_setopt",
    "curl_multi_getcontent",
    "curl_multi_info_read",
    "curl_multi_remove_handle",
    "curl_multi_close",
];

pub const HTTP_SCRIPT: &[&str] = &[
    "curl_init",
    "curl_setopt",
    "curl_setopt_array",
    "curl_exec",
    "curl_getinfo",
    "curl_errno",
    "curl_error",
    "curl_reset",
    "curl_close",
    "curl_multi_getcontent",
];

/// Routines that cannot work once more than one task shares the process.
pub const UNSAFE: &[&str] = &[
    "pcntl_fork",
    "pcntl_rfork",
    "pcntl_wait",
    "pcntl_waitpid",
    "pcntl_sigtimedwait",
    "pcntl_sigwaitinfo",
];

/// Replaced at context creation, independent of flags.
pub const ENV: &[&str] = &["putenv"];

/// `(companion class, host class)`: the companion gains the host class's
/// identity while the category is on.
pub const SOCKET_CLASS_LINK: (&str, &str) = ("Swoole\\Coroutine\\Socket", "Socket");
pub const HTTP_CLASS_LINK: (&str, &str) = ("Swoole\\Curl\\Handler", "CurlHandle");

pub fn script_companion(name: &str) -> String {
    format!("{SCRIPT_PREFIX}{name}")
}

pub fn native_companion(name: &str) -> String {
    format!("{NATIVE_PREFIX}{name}")
}
