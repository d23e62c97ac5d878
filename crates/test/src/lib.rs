//! A tiny simulated shop for end-to-end runs.
//!
//! [`SimShop`] is a [`Device`] that renders real grayscale screens (160x120)
//! made of 8x8 noise patches and reacts to clicks the way the game's shop
//! does: tap an empty slot, open the item list, pick an item, set the
//! counter, confirm. [`SimShop::write_profile`] writes the matching profile
//! and template images to a directory so runs go through the normal loader.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use image::{DynamicImage, GenericImage, GrayImage, Luma};

use kitbot_core::platform::Device;
use kitbot_core::settings::{CaptureSettings, ClassifierSettings, ConnectivitySettings, OrchestratorSettings, Settings};
use kitbot_core::types::{Frame, Point, Rect};
use kitbot_core::DeviceError;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const PATCH: u32 = 8;
pub const SLOTS: usize = 9;

pub const ITEMS: [&str; 3] = ["corn", "wheat", "carrot"];

const STATE_MARK: (u32, u32) = (4, 4);
const TUTORIAL_MARK: (u32, u32) = (20, 4);
const ITEM_ROW: (u32, u32) = (104, 40);
const DIGIT_AT: (u32, u32) = (124, 80);

pub const DISMISS: Point = Point::new(24, 8);
pub const PICKER: Point = Point::new(130, 24);
pub const INCREASE: Point = Point::new(148, 84);
pub const DECREASE: Point = Point::new(108, 84);
pub const MAX_PRICE: Point = Point::new(130, 100);
pub const CONFIRM: Point = Point::new(150, 112);

/// Screens the classifier can be shown; the shop is the one that plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Main,
    Shop,
    Book,
}

impl Screen {
    fn template(self) -> &'static str {
        match self {
            Screen::Main => "main_sign",
            Screen::Shop => "shop_sign",
            Screen::Book => "book_sign",
        }
    }
}

/// Seeds of every template the profile knows.
fn seed(id: &str) -> u32 {
    match id {
        "shop_sign" => 1,
        "main_sign" => 2,
        "book_sign" => 3,
        "tutorial" => 4,
        "empty" => 10,
        "sold" => 11,
        "goods" => 12,
        "corn" => 20,
        "wheat" => 21,
        "carrot" => 22,
        other => match other.strip_prefix("qty_").and_then(|v| v.parse::<u32>().ok()) {
            Some(v) => 100 + v,
            None => 999,
        },
    }
}

fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^ (h >> 16)
}

/// 8x8 noise patch, never flat, distinct per id.
pub fn patch(id: &str) -> GrayImage {
    let s = seed(id).wrapping_mul(0x9e37_79b9);
    GrayImage::from_fn(PATCH, PATCH, |x, y| {
        let h = mix(s ^ mix(x * 31 + y * 977 + 1));
        Luma([30 + (h % 196) as u8])
    })
}

fn stamp(canvas: &mut GrayImage, id: &str, (x, y): (u32, u32)) {
    // Patches are placed inside the canvas by construction.
    let _ = canvas.copy_from(&patch(id), x, y);
}

/// 1-based slot rectangle on a 3x3 grid.
pub fn slot_rect(slot: usize) -> Rect {
    let i = (slot - 1) as u32;
    Rect::new(4 + (i % 3) * 28, 22 + (i / 3) * 30, 24, 24)
}

pub fn slot_tap(slot: usize) -> Point {
    slot_rect(slot).center()
}

fn item_origin(k: usize) -> (u32, u32) {
    (ITEM_ROW.0 + k as u32 * 14, ITEM_ROW.1)
}

fn near(a: Point, b: Point) -> bool {
    (a.x - b.x).abs() <= 4 && (a.y - b.y).abs() <= 4
}

fn inside(r: Rect, p: Point) -> bool {
    p.x >= r.x as i32 && p.x < r.right() as i32 && p.y >= r.y as i32 && p.y < r.bottom() as i32
}

/// A screen with just the given state marker, for classifier runs.
pub fn screen_frame(screen: Screen, seq: u64) -> Frame {
    let mut canvas = GrayImage::new(WIDTH, HEIGHT);
    stamp(&mut canvas, screen.template(), STATE_MARK);
    Frame::new(canvas, seq)
}

/// A shop screen with the sell dialog's counter showing `value`.
pub fn counter_frame(value: u32, seq: u64) -> Frame {
    let mut canvas = GrayImage::new(WIDTH, HEIGHT);
    stamp(&mut canvas, "shop_sign", STATE_MARK);
    stamp(&mut canvas, &format!("qty_{value}"), DIGIT_AT);
    Frame::new(canvas, seq)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Sold,
    Goods,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialog {
    Closed,
    Open { slot: usize },
    Picking { slot: usize },
    Counting { slot: usize, item: usize, quantity: u32 },
}

/// One confirmed sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    pub slot: usize,
    pub item: &'static str,
    pub quantity: u32,
}

struct World {
    cells: Vec<Cell>,
    dialog: Dialog,
    tutorial: bool,
    tutorials: u32,
    sales: Vec<Sale>,
    collected: Vec<usize>,
    clicks: usize,
    tutorial_after: Option<usize>,
    disconnect_after: Option<usize>,
}

pub struct SimShop {
    world: Mutex<World>,
    connected: AtomicBool,
}

impl Default for SimShop {
    fn default() -> Self {
        Self::new()
    }
}

impl SimShop {
    /// Shop with every slot empty.
    pub fn new() -> Self {
        Self {
            world: Mutex::new(World {
                cells: vec![Cell::Empty; SLOTS],
                dialog: Dialog::Closed,
                tutorial: false,
                tutorials: 0,
                sales: Vec::new(),
                collected: Vec::new(),
                clicks: 0,
                tutorial_after: None,
                disconnect_after: None,
            }),
            connected: AtomicBool::new(true),
        }
    }

    pub fn with_cell(self, slot: usize, cell: Cell) -> Self {
        self.lock().cells[slot - 1] = cell;
        self
    }

    /// Pop the tutorial overlay right after the `n`-th sale.
    pub fn tutorial_after(self, n: usize) -> Self {
        self.lock().tutorial_after = Some(n);
        self
    }

    /// Drop the device link right after the `n`-th sale.
    pub fn disconnect_after(self, n: usize) -> Self {
        self.lock().disconnect_after = Some(n);
        self
    }

    pub fn sales(&self) -> Vec<Sale> {
        self.lock().sales.clone()
    }

    pub fn collected(&self) -> Vec<usize> {
        self.lock().collected.clone()
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.lock().cells.clone()
    }

    pub fn tutorials_shown(&self) -> u32 {
        self.lock().tutorials
    }

    pub fn tutorial_visible(&self) -> bool {
        self.lock().tutorial
    }

    pub fn clicks(&self) -> usize {
        self.lock().clicks
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(world: &World) -> GrayImage {
        let mut canvas = GrayImage::new(WIDTH, HEIGHT);
        stamp(&mut canvas, Screen::Shop.template(), STATE_MARK);
        if world.tutorial {
            stamp(&mut canvas, "tutorial", TUTORIAL_MARK);
        }
        for (i, cell) in world.cells.iter().enumerate() {
            let r = slot_rect(i + 1);
            let id = match cell {
                Cell::Empty => "empty",
                Cell::Sold => "sold",
                Cell::Goods => "goods",
            };
            stamp(&mut canvas, id, (r.x + 8, r.y + 8));
        }
        match world.dialog {
            Dialog::Picking { .. } => {
                for (k, item) in ITEMS.iter().enumerate() {
                    stamp(&mut canvas, item, item_origin(k));
                }
            }
            Dialog::Counting { quantity, .. } => stamp(&mut canvas, &format!("qty_{quantity}"), DIGIT_AT),
            Dialog::Open { .. } | Dialog::Closed => {}
        }
        canvas
    }

    fn press(&self, world: &mut World, at: Point) {
        if world.tutorial {
            if near(at, DISMISS) {
                world.tutorial = false;
            }
            return;
        }
        world.dialog = match world.dialog {
            Dialog::Closed => {
                let Some(slot) = (1..=SLOTS).find(|&s| inside(slot_rect(s), at)) else {
                    return;
                };
                match world.cells[slot - 1] {
                    Cell::Sold => {
                        world.cells[slot - 1] = Cell::Empty;
                        world.collected.push(slot);
                        Dialog::Closed
                    }
                    Cell::Empty => Dialog::Open { slot },
                    Cell::Goods => Dialog::Closed,
                }
            }
            Dialog::Open { slot } if near(at, PICKER) => Dialog::Picking { slot },
            Dialog::Picking { slot } => {
                let picked = (0..ITEMS.len()).find(|&k| {
                    let (x, y) = item_origin(k);
                    inside(Rect::new(x, y, PATCH, PATCH), at)
                });
                match picked {
                    Some(item) => Dialog::Counting { slot, item, quantity: 1 },
                    None => Dialog::Picking { slot },
                }
            }
            Dialog::Counting { slot, item, quantity } => {
                if near(at, INCREASE) {
                    Dialog::Counting { slot, item, quantity: (quantity + 1).min(10) }
                } else if near(at, DECREASE) {
                    Dialog::Counting { slot, item, quantity: quantity.saturating_sub(1).max(1) }
                } else if near(at, CONFIRM) {
                    world.cells[slot - 1] = Cell::Goods;
                    world.sales.push(Sale { slot, item: ITEMS[item], quantity });
                    self.after_sale(world);
                    Dialog::Closed
                } else {
                    Dialog::Counting { slot, item, quantity }
                }
            }
            other => other,
        };
    }

    fn after_sale(&self, world: &mut World) {
        let sold = world.sales.len();
        if world.tutorial_after == Some(sold) {
            world.tutorial = true;
            world.tutorials += 1;
        }
        if world.disconnect_after == Some(sold) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Write `profile.json` and every template image into `dir`.
    pub fn write_profile(dir: &Path) -> io::Result<PathBuf> {
        let mut ids: Vec<String> = ["shop_sign", "main_sign", "book_sign", "tutorial", "empty", "sold"]
            .iter()
            .chain(ITEMS.iter())
            .map(|s| s.to_string())
            .collect();
        ids.extend((1..=10).map(|v| format!("qty_{v}")));
        for id in &ids {
            patch(id)
                .save(dir.join(format!("{id}.png")))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        let template = |id: &str, roi: Option<[u32; 4]>| {
            let roi = roi.map(|r| format!(", \"roi\": [{}, {}, {}, {}]", r[0], r[1], r[2], r[3])).unwrap_or_default();
            format!("{{\"id\": \"{id}\", \"path\": \"{id}.png\", \"threshold\": 0.9{roi}}}")
        };
        let point = |p: Point| format!("[{}, {}]", p.x, p.y);

        let mut templates = vec![
            template("shop_sign", Some([0, 0, 16, 16])),
            template("main_sign", Some([0, 0, 16, 16])),
            template("book_sign", Some([0, 0, 16, 16])),
            template("tutorial", Some([16, 0, 16, 16])),
            template("empty", None),
            template("sold", None),
        ];
        templates.extend(ITEMS.iter().map(|id| template(id, Some([100, 34, 60, 20]))));
        templates.extend((1..=10).map(|v| template(&format!("qty_{v}"), None)));

        let regions: Vec<String> = (1..=SLOTS)
            .map(|s| {
                let r = slot_rect(s);
                format!("{{\"roi\": [{}, {}, {}, {}], \"tap\": {}}}", r.x, r.y, r.w, r.h, point(slot_tap(s)))
            })
            .collect();
        let digits: Vec<String> = (1..=10).map(|v| format!("\"qty_{v}\"")).collect();

        let json = format!(
            r#"{{
  "templates": [
    {templates}
  ],
  "states": [
    {{"state": "tutorial_overlay", "display_name": "Tutorial", "templates": ["tutorial"]}},
    {{"state": "shop_interior", "display_name": "Shop", "templates": ["shop_sign"]}},
    {{"state": "main_screen", "display_name": "Farm", "templates": ["main_sign"]}},
    {{"state": "book_overlay", "display_name": "Book", "templates": ["book_sign"]}}
  ],
  "actions": {{
    "tutorial_overlay": [{{"type": "click", "x": {dx}, "y": {dy}}}, {{"type": "wait", "ms": 50}}]
  }},
  "slots": {{
    "sold_template": "sold",
    "empty_template": "empty",
    "regions": [
      {regions}
    ]
  }},
  "shop": {{"item_picker": {picker}, "max_price": {max_price}, "confirm": {confirm}, "settle_ms": 80}},
  "quantity": {{
    "roi": [116, 72, 24, 24],
    "increase": {increase},
    "decrease": {decrease},
    "digits": [{digits}]
  }},
  "kit": {{"name": "farm", "items": [
    {{"name": "corn", "template": "corn", "quantity": 10, "first_slot_quantity": 9, "slots": 3}},
    {{"name": "wheat", "template": "wheat", "quantity": 10, "slots": 3}},
    {{"name": "carrot", "template": "carrot", "quantity": 10, "slots": 3}}
  ]}}
}}
"#,
            templates = templates.join(",\n    "),
            dx = DISMISS.x,
            dy = DISMISS.y,
            regions = regions.join(",\n      "),
            picker = point(PICKER),
            max_price = point(MAX_PRICE),
            confirm = point(CONFIRM),
            increase = point(INCREASE),
            decrease = point(DECREASE),
            digits = digits.join(", "),
        );
        let path = dir.join("profile.json");
        fs::write(&path, json)?;
        Ok(path)
    }
}

impl Device for SimShop {
    fn name(&self) -> &str {
        "sim-shop"
    }

    fn click(&self, at: Point) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        let mut world = self.lock();
        world.clicks += 1;
        self.press(&mut world, at);
        Ok(())
    }

    fn capture(&self) -> Result<DynamicImage, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected);
        }
        Ok(DynamicImage::ImageLuma8(Self::render(&self.lock())))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Settings tuned for a simulated device: fast frames, short waits.
pub fn fast_settings() -> Settings {
    Settings {
        capture: CaptureSettings {
            fps: 25.0,
            queue_capacity: 4,
            sample_timeout_ms: 500,
            failure_threshold: 2,
            stop_timeout_ms: 500,
        },
        classifier: ClassifierSettings { poll_ms: 50 },
        orchestrator: OrchestratorSettings {
            run_timeout_secs: 30,
            poll_ms: 20,
            retry_delay_ms: 40,
            settle_ms: 30,
            frame_wait_ms: 1000,
            quantity_slack: 3,
            max_step_failures: 5,
            max_restarts: 3,
            max_fill_passes: 3,
        },
        connectivity: ConnectivitySettings { interval_ms: 100 },
        ..Settings::default()
    }
}
