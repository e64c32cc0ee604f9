// src/async_server.rs
use std::thread::{self, JoinHandle};

use crate::error::{ServerError, ServerResult};
use crate::server::{HttpServer, StopHandle};

/// Background-thread wrapper around an engine: the server runs on its own
/// thread while the caller keeps a stop handle and can collect the loop's
/// outcome later.
pub struct AsyncHttpServer {
    handle: Option<JoinHandle<ServerResult<()>>>,
    stop: StopHandle,
    port: u16,
}

impl AsyncHttpServer {
    /// Take ownership of a (stopped) engine and run it on a new thread.
    pub fn spawn(mut server: HttpServer) -> ServerResult<Self> {
        if server.is_running() {
            return Err(ServerError::Running);
        }
        let stop = server.stop_handle();
        let port = server.port();
        let handle = thread::Builder::new()
            .name("aeronet-engine".to_string())
            .spawn(move || server.run())
            .map_err(ServerError::Io)?;
        Ok(Self {
            handle: Some(handle),
            stop,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Non-blocking stop request; idempotent.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Stop and wait for the loop to exit, returning its outcome. A
    /// second call after the join is a no-op returning Ok.
    pub fn stop_and_join(&mut self) -> ServerResult<()> {
        self.request_stop();
        self.join_inner()
    }

    /// Surface an error from an engine thread that already exited
    /// (including panics); returns Ok while the engine is still running.
    pub fn rethrow_if_error(&mut self) -> ServerResult<()> {
        match &self.handle {
            Some(handle) if handle.is_finished() => self.join_inner(),
            _ => Ok(()),
        }
    }

    fn join_inner(&mut self) -> ServerResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ServerError::EnginePanic(msg))
            }
        }
    }
}

impl Drop for AsyncHttpServer {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
