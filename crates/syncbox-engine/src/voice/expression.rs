use heapless::Deque;

/// Pending expression events per voice.
pub(crate) const EXPRESSION_CAPACITY: usize = 32;

/// Live MIDI expression routed to a sounding voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Expression {
    Control { channel: i8, control: u8, value: u8 },
    /// Bend in semitones, already scaled to the channel's range.
    PitchBend { channel: i8, semitones: f32 },
    /// `note == -1` for channel pressure.
    Aftertouch { channel: i8, note: i16, pressure: u8 },
}

impl Expression {
    pub(crate) fn channel(&self) -> i8 {
        match *self {
            Expression::Control { channel, .. }
            | Expression::PitchBend { channel, .. }
            | Expression::Aftertouch { channel, .. } => channel,
        }
    }

    /// Channel `-1` addresses every voice.
    pub(crate) fn addresses(&self, midi_channel: i8) -> bool {
        let channel = self.channel();
        channel == -1 || channel == midi_channel
    }
}

/// Frame-keyed ring consumed sample by sample during a callback.
#[derive(Debug, Default)]
pub(crate) struct ExpressionQueue {
    events: Deque<(u32, Expression), EXPRESSION_CAPACITY>,
}

impl ExpressionQueue {
    /// Drops the event when the ring is full.
    pub(crate) fn push(&mut self, frame: u32, expression: Expression) -> bool {
        match self.events.push_back((frame, expression)) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(frame, "voice expression ring full");
                false
            }
        }
    }

    /// Next event due at or before `frame`.
    #[inline]
    pub(crate) fn pop_due(&mut self, frame: u32) -> Option<Expression> {
        match self.events.front() {
            Some(&(due, _)) if due <= frame => self.events.pop_front().map(|(_, event)| event),
            _ => None,
        }
    }

    /// Applies anything left over at the start of the next callback.
    pub(crate) fn rebase(&mut self) {
        for (frame, _) in self.events.iter_mut() {
            *frame = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}
