//! The stack instance: construction, reset cascade, and the cooperative
//! service tick.

use alloc::boxed::Box;
use alloc::vec::Vec;

use thiserror::Error;

use crate::collections::PacketQueue;
use crate::config::{APP_IN_BUF_SIZE_CODE, APP_IN_Q_CNT_CODE, CHECKSUM_TIMER_MS, LED_TIMER_MS,
	MAX_APDU_SIZE, PERSISTENT_FLUSH_GUARD_MS, PROGRAM_ID_LEN};
use crate::drivers::link::{LinkDriver, LinkPort};
use crate::entropy::ChallengeRng;
use crate::net::addr::{Destination, DestinationAddress, Domain};
use crate::net::npdu::{PduType, ProtocolVersion};
use crate::net::{NetLayer, NwSendParam};
use crate::node::persist::{PersistentStore, load_network_image, write_network_image};
use crate::node::{NodeConfig, NodeState, ResetCause, decode_buffer_cnt, decode_buffer_size};
use crate::stats::{Stat, Statistics, SystemError};
use crate::time::{Clock, LonTimer};
use crate::transport::tcs::Tcs;
use crate::transport::{AppEvent, CompletionEvent, IncomingMessage, ResponseParam,
	SendAddress, SendDomain, SendRequest, Service, Tsa};

/// Application-facing queues: delivered messages, and completion events
/// plus responses.
pub(crate) struct AppQueues {
	pub in_q: PacketQueue<IncomingMessage>,
	pub ce_rsp_q: PacketQueue<AppEvent>,
	pub in_buf_size: usize,
}

impl AppQueues {
	fn reset() -> Self {
		Self {
			in_q: PacketQueue::with_capacity(decode_buffer_cnt(APP_IN_Q_CNT_CODE).into()),
			ce_rsp_q: PacketQueue::with_capacity(
				decode_buffer_cnt(APP_IN_Q_CNT_CODE).into(),
			),
			in_buf_size: decode_buffer_size(APP_IN_BUF_SIZE_CODE).into(),
		}
	}
}

/// Service-LED indication derived from the node state each LED tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceLed {
	On,
	Off,
	Blinking,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
	#[error("the stack queue for this submission is full")]
	QueueFull,
	#[error("the message does not fit the stack buffers")]
	TooLarge,
	#[error("the destination cannot be sent to")]
	NotRepresentable,
}

/// Compile-time identity of a stack instance.
#[derive(Clone, Copy, Debug)]
pub struct StackConfig {
	pub program_id: [u8; PROGRAM_ID_LEN],
	/// Application signature guarding the persistent image.
	pub signature: u32,
	pub protocol_version: ProtocolVersion,
	/// Seed for the challenge-byte generator.
	pub entropy_seed: [u8; 32],
}

/// One protocol-stack instance.
///
/// Construct once, then call [`service`](Self::service) on every tick
/// (nominally each millisecond).  Multi-stack deployments construct
/// several instances; nothing is shared between them.
pub struct Stack {
	pub(crate) clock: Box<dyn Clock>,
	pub(crate) store: Box<dyn PersistentStore>,
	pub(crate) rng: ChallengeRng,
	pub(crate) node: NodeConfig,
	pub(crate) stats: Statistics,
	pub(crate) tcs: Tcs,
	pub(crate) tsa: Tsa,
	pub(crate) net: NetLayer,
	pub(crate) link: LinkDriver,
	pub(crate) app: AppQueues,
	pub(crate) protocol_version: ProtocolVersion,
	signature: u32,
	reset_cause: ResetCause,
	reset_pending: bool,
	config_dirty: bool,
	flush_timer: LonTimer,
	led_timer: LonTimer,
	checksum_timer: LonTimer,
	service_led: ServiceLed,
}

impl Stack {
	/// Brings up a stack instance: restores the persistent image (or falls
	/// back to factory defaults), then runs the first reset cascade.
	pub fn new(
		config: StackConfig,
		ports: Vec<Box<dyn LinkPort>>,
		mut store: Box<dyn PersistentStore>,
		clock: Box<dyn Clock>,
	) -> Self {
		let mut node = NodeConfig::factory(config.program_id);
		let restored = load_network_image(&mut *store, &mut node, config.signature);
		if restored.is_none() {
			log::info!("no usable network image; using factory defaults");
		}

		let mut stack = Self {
			clock,
			store,
			rng: ChallengeRng::new(config.entropy_seed),
			node,
			stats: Statistics::new(),
			tcs: Tcs::new(config.protocol_version.max_tid()),
			tsa: Tsa::reset(),
			net: NetLayer::reset(),
			link: LinkDriver::new(ports),
			app: AppQueues::reset(),
			protocol_version: config.protocol_version,
			signature: config.signature,
			reset_cause: ResetCause::PowerUp,
			reset_pending: false,
			config_dirty: false,
			flush_timer: LonTimer::new(),
			led_timer: LonTimer::new(),
			checksum_timer: LonTimer::new(),
			service_led: ServiceLed::Off,
		};
		stack.node.config_checksum = stack.node.compute_config_checksum();
		stack.node_reset(true);
		stack.led_timer.set(&*stack.clock, LED_TIMER_MS);
		stack.checksum_timer.set(&*stack.clock, CHECKSUM_TIMER_MS);
		stack
	}

	/// Requests an externally triggered reset; performed on the next tick.
	pub fn request_reset(&mut self, cause: ResetCause) {
		self.reset_cause = cause;
		self.reset_pending = true;
	}

	/// Re-initializes every subsystem, leaves first.
	fn node_reset(&mut self, first_reset: bool) {
		let cause = self.reset_cause;
		log::info!("node reset ({cause:?})");
		self.stats.clear();

		// A node reset while soft-offline comes back online.
		if self.node.read_only.node_state == NodeState::SoftOffline {
			self.node.read_only.node_state = NodeState::ConfigOnline;
		}

		self.link.reset(&*self.clock);
		self.net = NetLayer::reset();
		self.tsa = Tsa::reset();
		self.tcs
			.reset(cause == ResetCause::PowerUp || cause == ResetCause::External);
		self.app = AppQueues::reset();

		if first_reset {
			self.rng.clear_history();
		}
		// Quiet period so peers' receive records from the previous
		// incarnation expire before we pick fresh transaction numbers.
		self.start_ts_delay(cause);
		self.reset_pending = false;

		if !first_reset {
			let _ = self.app.ce_rsp_q.enqueue(AppEvent::Reset(cause));
		}
	}

	/// One cooperative scheduler tick: housekeeping, one send step per
	/// layer top-down, one receive step per layer bottom-up.  Never
	/// blocks; with nothing to do it only advances timer state.
	pub fn service(&mut self) {
		if self.reset_pending {
			self.node_reset(false);
			return;
		}

		self.housekeeping();

		// Send steps, application-side first.
		self.sn_send();
		self.tp_send();
		self.auth_send();
		self.nw_send();
		self.lk_send();

		// Receive steps, wire-side first.
		self.lk_receive();
		self.nw_receive();
		self.auth_receive();
		self.tp_receive();
		self.sn_receive();
	}

	fn housekeeping(&mut self) {
		if self.led_timer.expired(&*self.clock) {
			let led = match self.node.read_only.node_state {
				NodeState::AppUnconfig => ServiceLed::Blinking,
				NodeState::ConfigOnline => ServiceLed::Off,
				NodeState::NoAppUnconfig => ServiceLed::On,
				_ => self.service_led,
			};
			if led != self.service_led {
				log::debug!("service led -> {led:?}");
				self.service_led = led;
			}
			self.led_timer.set(&*self.clock, LED_TIMER_MS);
		}

		if self.checksum_timer.expired(&*self.clock) {
			if !self.node.unconfigured()
				&& self.node.config_checksum != self.node.compute_config_checksum()
			{
				log::error!("configuration checksum mismatch; going unconfigured");
				self.node.read_only.node_state = NodeState::AppUnconfig;
				self.record_error(SystemError::ConfigChecksumError);
				self.request_reset(ResetCause::Software);
			}
			self.checksum_timer.set(&*self.clock, CHECKSUM_TIMER_MS);
		}

		if self.config_dirty && self.flush_timer.expired(&*self.clock) {
			self.flush_config();
		}
	}

	fn flush_config(&mut self) {
		match write_network_image(&mut *self.store, &self.node, self.signature, self.reset_cause)
		{
			Ok(()) => self.config_dirty = false,
			Err(err) => log::error!("persistent write failed: {err}"),
		}
	}

	/// Submits an outbound message.  Unacknowledged sends bypass the
	/// transport layer as plain APDUs; everything else is queued for the
	/// transport or session layer.
	pub fn submit(&mut self, request: SendRequest) -> Result<(), SubmitError> {
		if request.apdu.len() > MAX_APDU_SIZE {
			return Err(SubmitError::TooLarge);
		}
		match request.service {
			Service::Unacknowledged => self.submit_unacked(request),
			// Responses go through `respond`, keyed by request id.
			Service::Response => Err(SubmitError::NotRepresentable),
			_ => {
				if request.apdu.len() > self.tsa.out_buf_size {
					return Err(SubmitError::TooLarge);
				}
				let q = if request.priority {
					&mut self.tsa.out_pri_q
				} else {
					&mut self.tsa.out_q
				};
				q.enqueue(request).map_err(|_| SubmitError::QueueFull)
			}
		}
	}

	/// Plain unacknowledged datagram: straight to the network layer; the
	/// network layer posts the completion event.
	fn submit_unacked(&mut self, request: SendRequest) -> Result<(), SubmitError> {
		let domain = match request.domain {
			SendDomain::FromAddress => Domain::table(match request.dest {
				SendAddress::SubnetNode { domain_index, .. }
				| SendAddress::Group { domain_index, .. }
				| SendAddress::Broadcast { domain_index, .. }
				| SendAddress::UniqueId { domain_index, .. } => domain_index,
				SendAddress::Turnaround { .. } => 0,
			}),
			SendDomain::Table(index) => Domain::table(index),
			SendDomain::Flex { len, id } => Domain::flex(len, id),
		};
		let dest = match request.dest {
			SendAddress::SubnetNode { subnet, node, .. } => {
				Destination::SubnetNode { subnet, node }
			}
			SendAddress::Group { group, .. } => Destination::Multicast { group },
			SendAddress::Broadcast { subnet, .. } => Destination::Broadcast { subnet },
			SendAddress::UniqueId { subnet, id, .. } => Destination::UniqueId { subnet, id },
			SendAddress::Turnaround { .. } => return Err(SubmitError::NotRepresentable),
		};
		let param = NwSendParam {
			dest: DestinationAddress { domain, dest },
			pdu_type: PduType::Apdu,
			version: self.protocol_version,
			delta_backlog: 1,
			alt_path: request.alt_path_override.unwrap_or_default(),
			drop_if_unconfigured: true,
			tag: request.tag,
			pdu: request.apdu,
		};
		let q = if request.priority { &mut self.net.out_pri_q } else { &mut self.net.out_q };
		q.enqueue(param).map_err(|_| SubmitError::QueueFull)
	}

	/// Submits the application's response to a delivered request.
	pub fn respond(&mut self, response: ResponseParam) -> Result<(), SubmitError> {
		if response.apdu.len() > self.tsa.resp_buf_size {
			return Err(SubmitError::TooLarge);
		}
		self.tsa
			.resp_q
			.enqueue(response)
			.map_err(|_| SubmitError::QueueFull)
	}

	/// Drains the next application event: completions and responses first,
	/// then delivered messages.
	pub fn poll_event(&mut self) -> Option<AppEvent> {
		if let Some(event) = self.app.ce_rsp_q.dequeue() {
			return Some(event);
		}
		self.app.in_q.dequeue().map(AppEvent::Message)
	}

	pub(crate) fn post_completion(&mut self, tag: u16, success: bool) {
		let event = AppEvent::Completion(CompletionEvent { tag, success });
		if self.app.ce_rsp_q.enqueue(event).is_err() {
			// Callers check for space first; losing a completion would
			// strand the application.
			log::error!("completion queue overflow despite caller check");
		}
	}

	/// Latches a system error and schedules a persistent flush.
	pub(crate) fn record_error(&mut self, err: SystemError) {
		if self.node.record_error(err) {
			self.touch_config();
		}
	}

	/// Marks the configuration changed; the image is flushed after the
	/// debounce period.
	pub fn touch_config(&mut self) {
		self.config_dirty = true;
		if !self.flush_timer.running(&*self.clock) {
			self.flush_timer.set(&*self.clock, PERSISTENT_FLUSH_GUARD_MS);
		}
	}

	/// Recomputes the configuration checksum after a deliberate
	/// configuration change (commissioning, table writes).
	pub fn commit_config(&mut self) {
		self.node.config_checksum = self.node.compute_config_checksum();
		self.touch_config();
	}

	// Accessors for the host application.

	pub fn node(&self) -> &NodeConfig {
		&self.node
	}

	/// Mutable configuration access for commissioning; call
	/// [`commit_config`](Self::commit_config) afterwards.
	pub fn node_mut(&mut self) -> &mut NodeConfig {
		&mut self.node
	}

	pub fn statistics(&self) -> &Statistics {
		&self.stats
	}

	pub fn stat(&self, stat: Stat) -> u32 {
		self.stats.get(stat)
	}

	pub fn error_log(&self) -> SystemError {
		self.node.error_log
	}

	pub fn service_led(&self) -> ServiceLed {
		self.service_led
	}

	pub fn reset_cause(&self) -> ResetCause {
		self.reset_cause
	}

	pub fn unique_id(&self) -> [u8; 6] {
		self.node.read_only.unique_id
	}

	/// True once every power-line interface has handed over its Unique ID.
	pub fn link_ready(&self) -> bool {
		self.link.unique_id_acquired()
	}

	/// Last sampled transceiver parameters of interface `index`.
	pub fn transceiver_status(&self, index: usize) -> Option<&[u8; crate::config::NUM_COMM_PARAMS]> {
		self.link.xcvr_params(index)
	}
}
