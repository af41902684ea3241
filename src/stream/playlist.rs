// src/stream/playlist.rs - Playlist subscriber stream
//
// Core features:
// - Ordered play items around one play engine
// - Pluggable next/previous selection, sequential with repeat/random/rewind
// - Items that cannot be found are skipped until one plays or none is left

use crate::error::{Error, Result};
use crate::stream::engine::{PlayEngine, PlaylistHost};
use crate::stream::play_item::PlayItem;
use crate::stream::state::{StateListener, StreamState};
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{Arc, Weak};

/// What a controller sees of the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistView {
    pub size: usize,
    pub repeat: bool,
    pub random: bool,
    pub rewind: bool,
}

/// Picks the next or previous index; `None` means the list is exhausted.
pub trait PlaylistController: Send + Sync {
    fn next_item(&self, playlist: &PlaylistView, current: Option<usize>) -> Option<usize>;

    fn previous_item(&self, playlist: &PlaylistView, current: Option<usize>) -> Option<usize>;
}

/// Sequential order; repeat replays the current item, random picks any
/// other item, rewind wraps around at either end.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimplePlaylistController;

impl SimplePlaylistController {
    fn random_other(size: usize, current: Option<usize>) -> Option<usize> {
        if size == 0 {
            return None;
        }
        if size == 1 {
            return Some(0);
        }
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(0..size);
            if Some(candidate) != current {
                return Some(candidate);
            }
        }
    }
}

impl PlaylistController for SimplePlaylistController {
    fn next_item(&self, playlist: &PlaylistView, current: Option<usize>) -> Option<usize> {
        if playlist.size == 0 {
            return None;
        }
        if playlist.repeat {
            if let Some(index) = current.filter(|index| *index < playlist.size) {
                return Some(index);
            }
        }
        if playlist.random {
            return Self::random_other(playlist.size, current);
        }
        let next = current.map_or(0, |index| index + 1);
        if next < playlist.size {
            Some(next)
        } else if playlist.rewind {
            Some(0)
        } else {
            None
        }
    }

    fn previous_item(&self, playlist: &PlaylistView, current: Option<usize>) -> Option<usize> {
        if playlist.size == 0 {
            return None;
        }
        if playlist.repeat {
            if let Some(index) = current.filter(|index| *index < playlist.size) {
                return Some(index);
            }
        }
        if playlist.random {
            return Self::random_other(playlist.size, current);
        }
        match current {
            Some(index) if index > 0 && index <= playlist.size => Some(index - 1),
            _ if playlist.rewind => Some(playlist.size - 1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Previous,
}

struct PlaylistInner {
    items: Vec<PlayItem>,
    current: Option<usize>,
    controller: Box<dyn PlaylistController>,
    repeat: bool,
    random: bool,
    rewind: bool,
}

impl PlaylistInner {
    fn view(&self) -> PlaylistView {
        PlaylistView {
            size: self.items.len(),
            repeat: self.repeat,
            random: self.random,
            rewind: self.rewind,
        }
    }

    fn step(&mut self, direction: Direction) -> Option<usize> {
        let view = self.view();
        self.current = match direction {
            Direction::Next => self.controller.next_item(&view, self.current),
            Direction::Previous => self.controller.previous_item(&view, self.current),
        };
        self.current
    }

    fn current_item(&self) -> Option<PlayItem> {
        self.current.and_then(|index| self.items.get(index).cloned())
    }
}

/// A subscriber stream playing a list of items through one [`PlayEngine`].
///
/// The playlist lock is never held while the engine runs, the engine calls
/// back through [`PlaylistHost`] when an item ends.
pub struct PlaylistSubscriberStream {
    engine: Arc<PlayEngine>,
    inner: Mutex<PlaylistInner>,
}

impl PlaylistSubscriberStream {
    /// Wraps `engine` and registers as its playlist host.
    pub fn new(engine: Arc<PlayEngine>) -> Arc<Self> {
        let stream = Arc::new(Self {
            engine,
            inner: Mutex::new(PlaylistInner {
                items: Vec::new(),
                current: None,
                controller: Box::new(SimplePlaylistController),
                repeat: false,
                random: false,
                rewind: false,
            }),
        });
        let host: Weak<dyn PlaylistHost> = Arc::downgrade(&stream) as Weak<dyn PlaylistHost>;
        stream.engine.set_host(host);
        stream
    }

    pub fn engine(&self) -> &Arc<PlayEngine> {
        &self.engine
    }

    pub fn stream_id(&self) -> u32 {
        self.engine.stream_id()
    }

    pub fn state(&self) -> StreamState {
        self.engine.state()
    }

    pub fn add_state_listener(&self, listener: StateListener) {
        self.engine.add_state_listener(listener);
    }

    // ========================================================================
    // Items
    // ========================================================================

    pub fn add_item(&self, item: PlayItem) {
        self.inner.lock().items.push(item);
    }

    pub fn add_item_at(&self, item: PlayItem, index: usize) {
        let mut inner = self.inner.lock();
        let index = index.min(inner.items.len());
        inner.items.insert(index, item);
        if let Some(current) = inner.current.filter(|current| *current >= index) {
            inner.current = Some(current + 1);
        }
    }

    pub fn remove_item(&self, index: usize) -> Option<PlayItem> {
        let mut inner = self.inner.lock();
        if index >= inner.items.len() {
            return None;
        }
        let removed = inner.items.remove(index);
        inner.current = match inner.current {
            Some(current) if current == index => None,
            Some(current) if current > index => Some(current - 1),
            other => other,
        };
        Some(removed)
    }

    pub fn remove_all_items(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.current = None;
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn item(&self, index: usize) -> Option<PlayItem> {
        self.inner.lock().items.get(index).cloned()
    }

    /// Index of the current item, `None` before the first play or once
    /// the list ran out.
    pub fn current_index(&self) -> Option<usize> {
        self.inner.lock().current
    }

    pub fn current_item(&self) -> Option<PlayItem> {
        self.inner.lock().current_item()
    }

    pub fn set_controller(&self, controller: Box<dyn PlaylistController>) {
        self.inner.lock().controller = controller;
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.inner.lock().repeat = repeat;
    }

    pub fn is_repeat(&self) -> bool {
        self.inner.lock().repeat
    }

    pub fn set_random(&self, random: bool) {
        self.inner.lock().random = random;
    }

    pub fn is_random(&self) -> bool {
        self.inner.lock().random
    }

    pub fn set_rewind(&self, rewind: bool) {
        self.inner.lock().rewind = rewind;
    }

    pub fn is_rewind(&self) -> bool {
        self.inner.lock().rewind
    }

    /// Whether advancing stays inside the list.
    pub fn has_more_items(&self) -> bool {
        let inner = self.inner.lock();
        let next = inner.current.map_or(0, |index| index + 1);
        next < inner.items.len() || inner.repeat
    }

    // ========================================================================
    // Playback
    // ========================================================================

    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    /// Plays the current item, the first one when nothing was played yet.
    pub fn play(&self) -> Result<()> {
        let attempts = {
            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                return Err(Error::PlaylistExhausted);
            }
            if inner.current.is_none() {
                inner.step(Direction::Next);
            }
            inner.items.len()
        };
        self.play_current(attempts, Direction::Next, true)
    }

    /// Jumps to `index` and plays it.
    pub fn set_item(&self, index: usize) -> Result<()> {
        if index >= self.item_count() {
            return Err(Error::PlaylistExhausted);
        }
        self.engine.stop()?;
        let attempts = {
            let mut inner = self.inner.lock();
            inner.current = Some(index);
            inner.items.len()
        };
        self.play_current(attempts, Direction::Next, true)
    }

    pub fn next_item(&self) -> Result<()> {
        self.move_and_play(Direction::Next)
    }

    pub fn previous_item(&self) -> Result<()> {
        self.move_and_play(Direction::Previous)
    }

    fn move_and_play(&self, direction: Direction) -> Result<()> {
        self.engine.stop()?;
        let attempts = {
            let mut inner = self.inner.lock();
            if inner.step(direction).is_none() {
                debug!("Stream {} playlist exhausted", self.stream_id());
                return Err(Error::PlaylistExhausted);
            }
            inner.items.len()
        };
        self.play_current(attempts, direction, false)
    }

    /// Plays the current item, skipping unplayable ones in `direction`.
    fn play_current(&self, attempts: usize, direction: Direction, with_reset: bool) -> Result<()> {
        for _ in 0..attempts {
            let item = match self.inner.lock().current_item() {
                Some(item) => item,
                None => break,
            };
            match self.engine.play(item, with_reset) {
                Ok(()) => return Ok(()),
                Err(Error::StreamNotFound(name)) => {
                    warn!("Stream {} skipping {}", self.stream_id(), name);
                    if self.inner.lock().step(direction).is_none() {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.inner.lock().current = None;
        Err(Error::PlaylistExhausted)
    }

    pub fn pause(&self, position: u32) -> Result<()> {
        self.engine.pause(position)
    }

    pub fn resume(&self, position: u32) -> Result<()> {
        self.engine.resume(position)
    }

    pub fn seek(&self, position: u32) -> Result<()> {
        self.engine.seek(position)
    }

    pub fn stop(&self) -> Result<()> {
        self.engine.stop()
    }

    pub fn close(&self) {
        self.engine.close();
    }

    pub fn receive_video(&self, receive: bool) -> bool {
        self.engine.receive_video(receive)
    }

    pub fn receive_audio(&self, receive: bool) -> bool {
        self.engine.receive_audio(receive)
    }

    pub fn set_buffer_duration(&self, duration: u32) {
        self.engine.set_buffer_duration(duration);
    }
}

impl PlaylistHost for PlaylistSubscriberStream {
    fn has_more_items(&self) -> bool {
        PlaylistSubscriberStream::has_more_items(self)
    }

    fn advance(&self) {
        match self.next_item() {
            Ok(()) | Err(Error::PlaylistExhausted) => {}
            Err(e) => warn!("Stream {} failed to advance: {e}", self.stream_id()),
        }
    }
}
