use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::{debug, warn};

use pvheater_common::measurement::{decode_float32_be, METER_REGISTER_LEN};
use pvheater_common::{HeaterEngine, MeterToken, RequestQueue};

use crate::host::monotonic_ms;

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Meter on the heating circuit (active power, import energy).
    pub local_addr: SocketAddr,
    /// House/grid meter; only polled in dynamic mode.
    pub house_addr: Option<SocketAddr>,
    pub slave: u8,
}

/// Producer half of the meter link: the tick loops schedule token reads, the
/// meter task consumes them. Overflow clears the backlog and tears the
/// connections down for a fresh start.
#[derive(Clone)]
pub struct MeterScheduler {
    queue: Arc<Mutex<RequestQueue>>,
    reset: Arc<AtomicBool>,
}

impl MeterScheduler {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(RequestQueue::default())),
            reset: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn schedule(&self, token: MeterToken) {
        let overflowed = !self.queue.lock().await.push(token);
        if overflowed {
            warn!("meter request backlog overflowed, restarting the link");
            self.reset.store(true, Ordering::Relaxed);
        }
    }

    async fn next(&self) -> Option<MeterToken> {
        self.queue.lock().await.pop()
    }

    fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::Relaxed)
    }
}

enum ReadOutcome {
    Value(f32),
    /// Modbus exception: the peer answered, keep the connection.
    Rejected,
    /// Transport failure: drop and reconnect.
    Disconnected,
}

pub fn spawn_meter_loop(
    engine: Arc<Mutex<HeaterEngine>>,
    scheduler: MeterScheduler,
    config: MeterConfig,
) {
    tokio::spawn(async move {
        let mut local: Option<Context> = None;
        let mut house: Option<Context> = None;

        loop {
            if scheduler.take_reset() {
                local = None;
                house = None;
            }

            let Some(token) = scheduler.next().await else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let (ctx, addr) = match token {
                MeterToken::RemotePower => {
                    let Some(addr) = config.house_addr else {
                        debug!("no house meter configured, skipping remote read");
                        continue;
                    };
                    (&mut house, addr)
                }
                _ => (&mut local, config.local_addr),
            };

            if ctx.is_none() {
                match tcp::connect_slave(addr, Slave(config.slave)).await {
                    Ok(connected) => *ctx = Some(connected),
                    Err(err) => {
                        warn!("meter connect to {addr} failed: {err}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                }
            }

            let Some(connected) = ctx.as_mut() else {
                continue;
            };
            match read_float(connected, token.register()).await {
                ReadOutcome::Value(value) => {
                    dispatch(&engine, token, value).await;
                }
                ReadOutcome::Rejected => {
                    // Logged in read_float; last-known value stays in place.
                }
                ReadOutcome::Disconnected => {
                    *ctx = None;
                }
            }
        }
    });
}

async fn read_float(ctx: &mut Context, register: u16) -> ReadOutcome {
    match ctx.read_input_registers(register, METER_REGISTER_LEN).await {
        Ok(Ok(words)) => {
            if words.len() == METER_REGISTER_LEN as usize {
                ReadOutcome::Value(decode_float32_be([words[0], words[1]]))
            } else {
                warn!("short meter response for register {register:#06x}");
                ReadOutcome::Rejected
            }
        }
        Ok(Err(exception)) => {
            warn!("meter rejected read of {register:#06x}: {exception}");
            ReadOutcome::Rejected
        }
        Err(err) => {
            warn!("meter read failed: {err}");
            ReadOutcome::Disconnected
        }
    }
}

async fn dispatch(engine: &Arc<Mutex<HeaterEngine>>, token: MeterToken, value: f32) {
    if !value.is_finite() {
        warn!("discarding non-finite meter value for {token:?}");
        return;
    }

    let now_ms = monotonic_ms();
    let mut engine = engine.lock().await;
    match token {
        MeterToken::LocalPower => engine.update_current_power(value, now_ms),
        MeterToken::LocalConsumption => engine.update_consumption(value, now_ms),
        MeterToken::RemotePower => engine.update_house_power(value, now_ms),
    }
}
