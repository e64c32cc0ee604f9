// src/multi.rs
//
// N independent engines on one port via SO_REUSEPORT; the kernel balances
// accepts across them. One thread per engine, optional core pinning.
// There is no shared mutable state between engines, only the shared
// kernel accept queue.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::Router;
use crate::server::{HttpServer, StopHandle};

pub struct MultiServer {
    config: ServerConfig,
    engines: usize,
    pin_cores: bool,
}

impl MultiServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            engines: num_cpus::get(),
            pin_cores: true,
        }
    }

    pub fn engines(mut self, engines: usize) -> Self {
        self.engines = engines.max(1);
        self
    }

    pub fn pin_cores(mut self, on: bool) -> Self {
        self.pin_cores = on;
        self
    }

    /// Bind all engines and run them on background threads. The first
    /// engine resolves an ephemeral port; the rest bind the same port
    /// through SO_REUSEPORT.
    pub fn start(self, router: Router) -> ServerResult<RunningMulti> {
        let mut config = self.config;
        if self.engines > 1 {
            config.reuse_port = true;
        }

        let mut servers = Vec::with_capacity(self.engines);
        let first = HttpServer::with_router(config.clone(), router.clone())?;
        config.port = first.port();
        servers.push(first);
        for _ in 1..self.engines {
            servers.push(HttpServer::with_router(config.clone(), router.clone())?);
        }

        let port = config.port;
        let stops: Vec<StopHandle> = servers.iter().map(|s| s.stop_handle()).collect();
        let core_ids = if self.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut threads = Vec::with_capacity(servers.len());
        for (i, mut server) in servers.into_iter().enumerate() {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let handle = thread::Builder::new()
                .name(format!("aeronet-engine-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    server.run()
                })
                .map_err(ServerError::Io)?;
            threads.push(handle);
        }

        Ok(RunningMulti {
            threads,
            stops,
            port,
        })
    }

    /// Start, wire Ctrl-C to a cooperative stop of every engine, and
    /// block until they all exit.
    pub fn serve(self, router: Router) -> ServerResult<()> {
        let running = self.start(router)?;
        let stops = running.stop_handles();
        if let Err(err) = ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, stopping engines");
            for stop in &stops {
                stop.stop();
            }
        }) {
            tracing::warn!(%err, "could not install Ctrl-C handler");
        }
        running.join()
    }
}

/// Handles for a started fleet.
pub struct RunningMulti {
    threads: Vec<JoinHandle<ServerResult<()>>>,
    stops: Vec<StopHandle>,
    port: u16,
}

impl RunningMulti {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop_handles(&self) -> Vec<StopHandle> {
        self.stops.clone()
    }

    /// Signal every engine to stop. Idempotent.
    pub fn stop_all(&self) {
        for stop in &self.stops {
            stop.stop();
        }
    }

    /// Stop everything and wait for the threads, bounded by `grace` of
    /// patience per engine for its in-flight responses.
    pub fn shutdown(self, grace: Duration) -> ServerResult<()> {
        self.stop_all();
        // Engines exit within one poll interval of the stop signal; the
        // grace period is only a hint for embedders that drained first.
        let _ = grace;
        self.join()
    }

    /// Wait for every engine; the first failure wins.
    pub fn join(self) -> ServerResult<()> {
        let mut first_err: Option<ServerError> = None;
        for handle in self.threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_err = first_err.or(Some(err)),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    first_err = first_err.or(Some(ServerError::EnginePanic(msg)));
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
