// Venturi - a portable aviation data receiver
// Copyright (C) 2018  The Venturi Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The 1 Hz output cycle: age the stores, snapshot the situation,
//! compose the cycle's messages in a fixed order and hand each one to
//! the fan-out engine. Clients therefore see a stable frame: the
//! heartbeats, then ownship, then alerting traffic by distance, then
//! the rest, then weather.

use processor::situation::Snapshot;
use processor::traffic::{AltitudeType, Target};
use processor::Stores;
use protocol::websocket::WebSocket;
use protocol::{self, gdl90, Family, Payload};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use time::now_utc;
use transport::Engine;

const TICK: Duration = Duration::from_secs(1);
const REALTIME_VALIDITY: Duration = Duration::from_secs(2);
const WEATHER_VALIDITY: Duration = Duration::from_secs(60);

const FIRMWARE_MAJOR: u8 = 0;
const FIRMWARE_MINOR: u8 = 1;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Our Mode-S code, when the installation has one.
    pub ownship_addr: Option<u32>,
    pub callsign: String,
    pub device_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            ownship_addr: None,
            callsign: "VENTURI".to_string(),
            device_name: "Venturi".to_string(),
        }
    }
}

pub struct Scheduler {
    stores: Stores,
    engine: Arc<Engine>,
    shutdown: Arc<AtomicBool>,
    status: Option<WebSocket>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        engine: Arc<Engine>,
        shutdown: Arc<AtomicBool>,
        status: Option<WebSocket>,
        config: SchedulerConfig,
    ) -> Scheduler {
        Scheduler {
            stores,
            engine,
            shutdown,
            status,
            config,
        }
    }

    /// Tick until shutdown. The in-flight cycle always completes, so
    /// no client ever sees half a frame.
    pub fn run(&mut self) {
        info!("output scheduler running");

        while !self.shutdown.load(Ordering::Relaxed) {
            // main output loop
            let before = Instant::now();

            self.cycle(before);

            let elapsed = before.elapsed();
            if elapsed < TICK {
                sleep(TICK - elapsed);
            } else {
                warn!("output cycle unable to keep up with the tick");
            }
        }

        info!("output scheduler stopped");
    }

    pub fn cycle(&mut self, now: Instant) {
        self.stores.traffic.age_and_extrapolate(now);
        self.stores.fisb.sweep(now);

        let snapshot = self.stores.situation.snapshot(now);
        self.stores.traffic.compute_relative(&snapshot, now);

        let stats = self.stores.traffic.stats();
        let (uplink_count, basic_long_count) = self.stores.counters.take();

        let utc = now_utc();
        let seconds_since_midnight =
            (utc.tm_hour * 3600 + utc.tm_min * 60 + utc.tm_sec) as u32;

        let realtime = Some(now + REALTIME_VALIDITY);

        // 1. heartbeats
        let hb = gdl90::heartbeat(&gdl90::Heartbeat {
            gps_valid: snapshot.gps.is_some(),
            maintenance: false,
            utc_ok: self.stores.clock.is_anchored(),
            seconds_since_midnight,
            uplink_count,
            basic_long_count,
        });
        self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, hb);

        let status = gdl90::status_heartbeat(&gdl90::StatusReport {
            fw_major: FIRMWARE_MAJOR,
            fw_minor: FIRMWARE_MINOR,
            gps_valid: snapshot.gps.is_some(),
            baro_valid: snapshot.baro.is_some(),
            ahrs_valid: snapshot.ahrs.is_some(),
            es_link_up: stats.es > 0,
            uat_link_up: stats.uat > 0,
            ogn_link_up: stats.ogn > 0,
            sat_locked: snapshot.gps.map_or(0, |g| g.sat_used),
            sat_seen: snapshot.gps.map_or(0, |g| g.sat_seen),
            es_targets: stats.es as u16,
            other_targets: (stats.uat + stats.ogn + stats.ais) as u16,
            es_rate: basic_long_count,
            uat_rate: uplink_count as u16,
            uptime_s: self.stores.clock.since_start().as_secs() as u32,
        });
        self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, status);

        // 2. ownship
        if let Some(gps) = snapshot.gps {
            let ownship = gdl90::ownship_report(&self.ownship_report(&snapshot));
            self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, ownship);

            let geo = gdl90::ownship_geo_altitude(&gdl90::GeoAltitude {
                alt_wgs84_ft: gps.height_wgs84_ft.round() as i32,
                vfom_m: vfom_from_accuracy(gps.horizontal_accuracy_m),
                vertical_warning: false,
            });
            self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, geo);
        }

        let id = gdl90::foreflight_id(&self.config.device_name);
        self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, id);

        if let Some(ahrs) = snapshot.ahrs {
            let msg = gdl90::foreflight_ahrs(&gdl90::AhrsReport {
                roll_deg: Some(ahrs.roll_deg),
                pitch_deg: Some(ahrs.pitch_deg),
                heading_deg: Some(ahrs.heading_deg),
                heading_is_true: false,
                ias_kt: None,
                tas_kt: None,
            });
            self.submit(Family::GDL90, protocol::PRIORITY_REALTIME, realtime, msg);
        }

        // NMEA ownship mirrors
        if let Some(gps) = snapshot.gps {
            self.submit(Family::NMEA, protocol::PRIORITY_REALTIME, realtime,
                        protocol::nmea::gprmc(&utc, &gps));
            self.submit(Family::NMEA, protocol::PRIORITY_REALTIME, realtime,
                        protocol::nmea::gpgga(&utc, &gps));
        }
        if let Some(baro) = snapshot.baro {
            self.submit(Family::NMEA, protocol::PRIORITY_REALTIME, realtime,
                        protocol::nmea::pgrmz(&baro));
        }

        // 3. traffic, alerts first, each stream distance-ordered
        let mut targets = self.stores.traffic.emitable_list(now);
        targets.sort_by(compare_targets);

        self.submit(Family::NMEA, protocol::PRIORITY_REALTIME, realtime,
                    protocol::nmea::pflau(&targets, &snapshot));

        let pres_alt_valid = snapshot.baro.is_some();

        for t in targets.iter().filter(|t| t.alertable) {
            self.submit_target(t, &snapshot, pres_alt_valid, protocol::PRIORITY_ALERT, realtime);
        }
        for t in targets.iter().filter(|t| !t.alertable) {
            self.submit_target(t, &snapshot, pres_alt_valid, protocol::PRIORITY_TRAFFIC,
                               realtime);
        }

        // 4. weather
        let weather_validity = Some(now + WEATHER_VALIDITY);
        for (_, payload, _) in self.stores.fisb.fresh_list(now) {
            self.submit(Family::GDL90, protocol::PRIORITY_WEATHER, weather_validity,
                        gdl90::uplink(&payload));
        }

        if let Some(ref status) = self.status {
            status.push_status(&snapshot, &stats, self.engine.client_count());
        }
    }

    fn submit_target(
        &self,
        t: &Target,
        snapshot: &Snapshot,
        pres_alt_valid: bool,
        priority: u8,
        valid_until: Option<Instant>,
    ) {
        let report = gdl90::traffic_report(&target_report(t, pres_alt_valid));
        self.submit(Family::GDL90, priority, valid_until, report);

        if let Some(sentence) = protocol::nmea::pflaa(t, snapshot) {
            self.submit(Family::NMEA, priority, valid_until, sentence);
        }
    }

    fn submit(&self, family: Family, priority: u8, valid_until: Option<Instant>, payload: Vec<u8>) {
        self.engine.submit(&Payload {
            family,
            priority,
            valid_until,
            payload,
        });
    }

    fn ownship_report(&self, snapshot: &Snapshot) -> gdl90::Report {
        let gps = snapshot.gps.expect("caller checked GPS validity");

        // GDL90 wants pressure altitude in the ownship report; the
        // geometric report carries the WGS-84 height
        let altitude_ft = match snapshot.baro {
            Some(baro) => Some(baro.pressure_alt_ft.round() as i32),
            None => Some(gps.alt_msl_ft.round() as i32),
        };

        let (addr, addr_type) = match self.config.ownship_addr {
            Some(code) => (code, 0),
            None => (0, 1), // self-assigned
        };

        gdl90::Report {
            alert: false,
            addr_type,
            addr,
            position_valid: true,
            lat: gps.lat,
            lon: gps.lon,
            altitude_ft,
            misc: 0x09, // airborne, true track
            nic: gps.nacp,
            nacp: gps.nacp,
            gs_kt: Some(gps.gs_kt.round() as u16),
            vs_fpm: Some(clamp_vs(gps.vs_fpm)),
            track_deg: Some(gps.true_course),
            emitter_category: 1, // light
            callsign: self.config.callsign.clone(),
            emergency: 0,
        }
    }
}

fn clamp_vs(vs_fpm: f32) -> i16 {
    if vs_fpm > 32_000.0 {
        32_000
    } else if vs_fpm < -32_000.0 {
        -32_000
    } else {
        vs_fpm.round() as i16
    }
}

fn vfom_from_accuracy(accuracy_m: f32) -> u16 {
    let vfom = (accuracy_m * 1.5).round() as u16;
    if vfom < 10 {
        10
    } else {
        vfom
    }
}

/// Distance ascending, unknown distances last, ties broken by address
/// for a reproducible frame.
fn compare_targets(a: &Target, b: &Target) -> CmpOrdering {
    let da = a.relative.map(|r| r.distance_nm).unwrap_or(::std::f32::INFINITY);
    let db = b.relative.map(|r| r.distance_nm).unwrap_or(::std::f32::INFINITY);

    da.partial_cmp(&db)
        .unwrap_or(CmpOrdering::Equal)
        .then(a.addr.0.cmp(&b.addr.0))
}

/// Turn a target record into the byte-level report, reconciling
/// altitude references the way the displays expect.
fn target_report(t: &Target, pres_alt_valid: bool) -> gdl90::Report {
    let mut altitude_ft = None;

    if let Some((alt, typ, _)) = t.altitude {
        let mut corrected = alt;

        if !pres_alt_valid && typ == AltitudeType::Baro {
            // no ownship baro: shift toward geometric using the
            // target's own split, so the display compares like with
            // like
            if let Some(delta) = t.gnss_delta {
                corrected += delta;
            }
        } else if pres_alt_valid && typ == AltitudeType::GNSS {
            if let Some(delta) = t.gnss_delta {
                corrected -= delta;
            }
        }

        altitude_ft = Some(corrected);
    }

    let addr_type = match t.addr.1 {
        ::processor::traffic::AddressType::ADSBICAO |
        ::processor::traffic::AddressType::ADSRICAO => 0,
        ::processor::traffic::AddressType::ADSBOther |
        ::processor::traffic::AddressType::ADSROther |
        ::processor::traffic::AddressType::OGNTracker => 1,
        ::processor::traffic::AddressType::TISBICAO => 2,
        ::processor::traffic::AddressType::TISBOther |
        ::processor::traffic::AddressType::Unknown => 3,
    };

    let mut misc = 0_u8;
    if t.on_ground != Some(true) {
        misc |= 0x08; // if unknown, assume airborne
    }
    if let Some((_, typ, _)) = t.track {
        misc |= match typ {
            ::processor::traffic::HeadingType::True => 0x01,
            ::processor::traffic::HeadingType::Mag => 0x02,
        };
    }

    let emergency = match t.squawk {
        Some(7500) | Some(7600) | Some(7700) => 1,
        _ => 0,
    };

    gdl90::Report {
        alert: t.alertable,
        addr_type,
        addr: t.addr.0 & 0x00FF_FFFF,
        position_valid: t.lat_lon.is_some(),
        lat: t.lat_lon.map(|((lat, _), _)| lat).unwrap_or(0.0),
        lon: t.lat_lon.map(|((_, lon), _)| lon).unwrap_or(0.0),
        altitude_ft,
        misc,
        nic: t.nic.unwrap_or(0),
        nacp: t.nacp.unwrap_or(0),
        gs_kt: t.speed.map(|(kt, _)| kt),
        vs_fpm: t.vs.map(|(fpm, _)| fpm),
        track_deg: t.track.map(|(deg, _, _)| deg as f32),
        emitter_category: t.category.unwrap_or(0),
        callsign: t.tail.clone().unwrap_or_default(),
        emergency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::clock::Monotonic;
    use processor::fisb::{FISBData, Fisb};
    use processor::situation::{FixQuality, GnssFix, Situation};
    use processor::traffic::{AddressType, Traffic, TrafficConfig};
    use sensor::TrafficData;
    use std::io;
    use std::sync::Mutex;
    use transport::{ClientInfo, Link, Subscription};

    struct RecordingLink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Link for RecordingLink {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.frames.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn stores() -> Stores {
        Stores {
            clock: Arc::new(Monotonic::new()),
            situation: Arc::new(Situation::new()),
            traffic: Arc::new(Traffic::new(TrafficConfig::default())),
            fisb: Arc::new(Fisb::new()),
            counters: Arc::new(Default::default()),
            discipline_clock: false,
        }
    }

    fn gnss_fix(lat: f32, lon: f32) -> GnssFix {
        GnssFix {
            time: None,
            quality: FixQuality::ThreeDim,
            lat,
            lon,
            alt_msl_ft: Some(3_000.0),
            geoid_sep_ft: Some(-60.0),
            hdop: Some(0.8),
            accuracy_m: None,
            sat_seen: Some(12),
            sat_used: Some(10),
            gs_kt: Some(95.0),
            true_course: Some(270.0),
        }
    }

    fn traffic_at(addr: u32, lat: f32, lon: f32) -> TrafficData {
        use processor::traffic::{AltitudeType, TargetType, TrafficSource};

        let mut d = TrafficData::new((addr, AddressType::ADSBICAO), TrafficSource::ES);
        d.target_type = Some(TargetType::ADSB);
        d.lat_lon = Some((lat, lon));
        d.altitude = Some((3_200, AltitudeType::Baro));
        d
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            ::std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_cycle_frame_order() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stores = stores();
        let engine = Engine::new(shutdown.clone());

        let frames = Arc::new(Mutex::new(vec![]));
        Engine::register(
            &engine,
            ClientInfo {
                name: "efb".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(RecordingLink { frames: frames.clone() }),
        );

        let now = stores.clock.now();
        stores.situation.update_gps(&gnss_fix(47.0, -122.0), now);

        // a close target (alert), a far one, and some weather
        stores.traffic.upsert(&traffic_at(0x200000, 47.0 + 1.0 / 60.0, -122.0), now);
        stores.traffic.upsert(&traffic_at(0x100000, 47.5, -122.0), now);
        stores.fisb.put(
            FISBData {
                product_id: 413,
                time_of_day_s: None,
                station: None,
                payload: vec![0_u8; 432],
            },
            now,
        );

        let mut scheduler = Scheduler::new(stores, engine.clone(), shutdown.clone(), None,
                                           SchedulerConfig::default());
        scheduler.cycle(now);

        // heartbeat, status, ownship, geo alt, FF id, 2 traffic, 1 uplink
        wait_for(|| frames.lock().unwrap().len() == 8);

        let ids: Vec<u8> = frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| gdl90::deframe(f).expect("every frame must verify")[0])
            .collect();
        assert_eq!(ids, vec![0x00, 0x53, 0x0A, 0x0B, 0x65, 0x14, 0x14, 0x07]);

        // the alerting (closer) target is emitted first
        let bodies: Vec<Vec<u8>> = frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| gdl90::deframe(f).unwrap())
            .collect();
        assert_eq!(&bodies[5][2..5], &[0x20, 0x00, 0x00]);
        assert_ne!(bodies[5][1] & 0x10, 0, "close target must alert");
        assert_eq!(&bodies[6][2..5], &[0x10, 0x00, 0x00]);
        assert_eq!(bodies[6][1] & 0x10, 0);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }

    #[test]
    fn test_no_gps_no_ownship_report() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stores = stores();
        let engine = Engine::new(shutdown.clone());

        let frames = Arc::new(Mutex::new(vec![]));
        Engine::register(
            &engine,
            ClientInfo {
                name: "efb".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(RecordingLink { frames: frames.clone() }),
        );

        let now = stores.clock.now();
        let mut scheduler = Scheduler::new(stores, engine.clone(), shutdown.clone(), None,
                                           SchedulerConfig::default());
        scheduler.cycle(now);

        // heartbeat, status and the id message still flow
        wait_for(|| frames.lock().unwrap().len() == 3);
        let ids: Vec<u8> = frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| gdl90::deframe(f).unwrap()[0])
            .collect();
        assert_eq!(ids, vec![0x00, 0x53, 0x65]);

        // heartbeat reports GPS invalid
        let hb = gdl90::deframe(&frames.lock().unwrap()[0]).unwrap();
        assert_eq!(hb[1] & 0x80, 0);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }

    #[test]
    fn test_ownship_suppressed_in_cycle() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stores = stores();
        let engine = Engine::new(shutdown.clone());

        let frames = Arc::new(Mutex::new(vec![]));
        Engine::register(
            &engine,
            ClientInfo {
                name: "efb".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(RecordingLink { frames: frames.clone() }),
        );

        let now = stores.clock.now();
        stores.situation.update_gps(&gnss_fix(47.0, -122.0), now);
        // somebody squitters our exact position and altitude
        let mut shadow = traffic_at(0x300000, 47.0, -122.0);
        shadow.altitude = Some((3_000, ::processor::traffic::AltitudeType::GNSS));
        shadow.gnss_delta = Some(0);
        stores.traffic.upsert(&shadow, now);

        let mut scheduler = Scheduler::new(stores, engine.clone(), shutdown.clone(), None,
                                           SchedulerConfig::default());
        scheduler.cycle(now);

        wait_for(|| frames.lock().unwrap().len() == 5);
        let ids: Vec<u8> = frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| gdl90::deframe(f).unwrap()[0])
            .collect();
        assert!(!ids.contains(&0x14), "ownship echo must not be rebroadcast");

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }
}
